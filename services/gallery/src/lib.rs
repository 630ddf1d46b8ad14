//! Gallery Gateway
//!
//! Serves a local directory tree over HTTP as a browsable media gallery.
//! Directories become HTML pages listing their children, media files are
//! embedded as players that load lazily, other files are plain links, and
//! video files can be asked for a still frame extracted on the fly.
//!
//! ## Features
//!
//! - **Content-based classification**: media types come from the leading
//!   bytes of each file, never from its extension
//! - **Lazy gallery pages**: players only fetch their source once they settle
//!   in the viewport
//! - **On-demand thumbnails**: a single JPEG frame per video, streamed from an
//!   external extractor with bounded concurrency and a deadline
//! - **Raw streaming**: any other file is streamed as-is in fixed-size chunks
//!
//! ## Architecture
//!
//! ```text
//!  HTTP request
//!       │
//!       ▼
//! ┌──────────────┐  directory  ┌──────────────┐        ┌──────────────┐
//! │ Request      │────────────▶│ Directory    │───────▶│ Metadata     │
//! │ Router       │             │ Lister       │        │ Prober       │
//! └──────────────┘             └──────────────┘        └──────────────┘
//!    │        │                       │
//!    │ file   │ ?poster               ▼
//!    │        │                ┌──────────────┐
//!    │        │                │ Gallery      │
//!    │        │                │ Renderer     │
//!    │        ▼                └──────────────┘
//!    │  ┌──────────────┐
//!    │  │ Thumbnail    │──────▶ ffmpeg (image2pipe)
//!    │  │ Extractor    │
//!    │  └──────────────┘
//!    ▼
//! ReaderStream (raw bytes)
//! ```

pub mod config;
pub mod listing;
pub mod net;
pub mod probe;
pub mod render;
pub mod router;
pub mod thumbnail;

pub use config::Config;
pub use listing::{list_directory, DirectoryListing};
pub use probe::{probe_entry, EntryKind, FileEntry, MediaCategory};
pub use render::{render_gallery, render_page};
pub use router::{create_router, start_server, AppState, RouteError};
pub use thumbnail::{ExtractionError, Thumbnail, ThumbnailExtractor};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reasons the gallery refuses to start
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("No root directory given")]
    MissingRoot,

    #[error("Root directory {0} does not exist")]
    RootNotFound(PathBuf),

    #[error("Root {0} is not a directory")]
    NotADirectory(PathBuf),
}

/// Check the root given on the command line and return its canonical form
pub fn validate_root(root: Option<&Path>) -> Result<PathBuf, StartupError> {
    let root = root.ok_or(StartupError::MissingRoot)?;

    let canonical = root
        .canonicalize()
        .map_err(|_| StartupError::RootNotFound(root.to_path_buf()))?;

    if !canonical.is_dir() {
        return Err(StartupError::NotADirectory(canonical));
    }

    Ok(canonical)
}
