//! Directory enumeration.

use crate::config::ListingConfig;
use crate::probe::{probe_entry, FileEntry};
use futures::stream::{self, StreamExt};
use std::ffi::OsString;
use std::io;
use std::path::Path;
use tracing::{debug, instrument, warn};

/// Children of one directory, in filesystem enumeration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryListing {
    pub entries: Vec<FileEntry>,
}

impl DirectoryListing {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter()
    }
}

/// List the direct children of `dir`.
///
/// Children that cannot be stat'ed by the time they are probed are left out.
#[instrument(skip(dir, config), fields(dir = %dir.display()))]
pub async fn list_directory(dir: &Path, config: &ListingConfig) -> io::Result<DirectoryListing> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();

    while let Some(entry) = read_dir.next_entry().await? {
        names.push(entry.file_name());
    }

    let listing = probe_children(dir, names, config).await;

    metrics::counter!("gallery_listings_total").increment(1);
    debug!(entries = listing.len(), "Directory listed");

    Ok(listing)
}

/// Probe `names` under `dir` with a bounded fan-out.
///
/// `buffered` yields results in input order, so the listing keeps the
/// enumeration order however the probes interleave.
async fn probe_children(
    dir: &Path,
    names: Vec<OsString>,
    config: &ListingConfig,
) -> DirectoryListing {
    let sniff_bytes = config.sniff_bytes;

    let entries: Vec<FileEntry> = stream::iter(names)
        .map(|name| {
            let path = dir.join(&name);
            async move {
                match probe_entry(&path, sniff_bytes).await {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping entry that could not be stat'ed");
                        metrics::counter!("gallery_entries_skipped_total").increment(1);
                        None
                    }
                }
            }
        })
        .buffered(config.probe_concurrency.max(1))
        .filter_map(|entry| async move { entry })
        .collect()
        .await;

    DirectoryListing { entries }
}
