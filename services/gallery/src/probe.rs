//! Per-entry metadata and content sniffing.
//!
//! Media types are decided from the leading bytes of a file, never from its
//! name.

use chrono::{DateTime, Local};
use std::borrow::Cow;
use std::ffi::OsString;
use std::fs::Metadata;
use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Media family of a regular file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCategory {
    Video,
    Audio,
    Image,
    Unknown,
}

impl MediaCategory {
    /// Classify a byte prefix
    pub fn from_bytes(prefix: &[u8]) -> Self {
        match infer::get(prefix).map(|kind| kind.matcher_type()) {
            Some(infer::MatcherType::Video) => MediaCategory::Video,
            Some(infer::MatcherType::Audio) => MediaCategory::Audio,
            Some(infer::MatcherType::Image) => MediaCategory::Image,
            _ => MediaCategory::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Video => "video",
            MediaCategory::Audio => "audio",
            MediaCategory::Image => "image",
            MediaCategory::Unknown => "unknown",
        }
    }
}

/// What an entry is, decided once while probing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File { size: u64, category: MediaCategory },
    /// Symlinks, devices, sockets and anything else that is neither
    Other,
}

/// One child of a listed directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// On-disk name, byte for byte
    pub name: OsString,
    pub kind: EntryKind,
    /// Access time formatted for display
    pub accessed: Option<String>,
}

impl FileEntry {
    /// Name for display; invalid UTF-8 is replaced
    pub fn display_name(&self) -> Cow<'_, str> {
        self.name.to_string_lossy()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    pub fn is_regular_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    /// Media category, `None` for anything but regular files
    pub fn category(&self) -> Option<MediaCategory> {
        match self.kind {
            EntryKind::File { category, .. } => Some(category),
            _ => None,
        }
    }
}

/// Stat `path` and, for regular files, sniff the first `sniff_bytes` bytes.
///
/// Only the stat can fail; sniffing problems degrade to
/// [`MediaCategory::Unknown`].
pub async fn probe_entry(path: &Path, sniff_bytes: usize) -> io::Result<FileEntry> {
    let metadata = tokio::fs::symlink_metadata(path).await?;

    let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();

    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File {
            size: metadata.len(),
            category: sniff(path, sniff_bytes).await,
        }
    } else {
        EntryKind::Other
    };

    Ok(FileEntry {
        name,
        kind,
        accessed: format_access_time(&metadata),
    })
}

/// Read at most `limit` leading bytes of `path` and classify them.
///
/// The handle is closed before returning.
pub async fn sniff(path: &Path, limit: usize) -> MediaCategory {
    match read_prefix(path, limit).await {
        Ok(prefix) => MediaCategory::from_bytes(&prefix),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Content sniffing failed");
            MediaCategory::Unknown
        }
    }
}

async fn read_prefix(path: &Path, limit: usize) -> io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; limit];
    let mut filled = 0;

    // a single read may come back short
    while filled < limit {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    buf.truncate(filled);
    Ok(buf)
}

fn format_access_time(metadata: &Metadata) -> Option<String> {
    let accessed = metadata.accessed().ok()?;
    let local: DateTime<Local> = accessed.into();
    Some(local.format("%Y-%m-%d %H:%M:%S").to_string())
}
