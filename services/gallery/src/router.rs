//! HTTP surface: one universal handler mapping request paths onto the root.

use crate::config::{Config, ListingConfig, ServerConfig};
use crate::listing::list_directory;
use crate::net;
use crate::probe::{sniff, MediaCategory};
use crate::render::render_page;
use crate::thumbnail::{ExtractionError, ThumbnailExtractor};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::{StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    Router,
};
use std::borrow::Cow;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

/// Application state shared across requests. Read-only once built.
#[derive(Clone)]
pub struct AppState {
    pub root: Arc<PathBuf>,
    pub listing: ListingConfig,
    pub thumbnails: Arc<ThumbnailExtractor>,
}

impl AppState {
    pub fn new(root: PathBuf, config: &Config) -> Self {
        Self {
            root: Arc::new(root),
            listing: config.listing.clone(),
            thumbnails: Arc::new(ThumbnailExtractor::new(config.thumbnail.clone())),
        }
    }
}

/// Per-request failures; none of them affect other requests
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Path not found")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        match self {
            RouteError::NotFound => StatusCode::NOT_FOUND.into_response(),
            RouteError::Io(e) => {
                error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
            // already logged with the extractor's stderr
            RouteError::Extraction(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Error generating image").into_response()
            }
        }
    }
}

/// Query parameters understood on file requests
#[derive(Debug, Default)]
pub struct FileQuery {
    /// Thumbnail marker
    pub poster: Option<String>,
}

impl FileQuery {
    /// Parse a raw query string. Unknown keys are ignored and the first
    /// `poster` wins when it is repeated.
    pub fn parse(raw: Option<&str>) -> Self {
        let poster = raw
            .unwrap_or_default()
            .split('&')
            .filter(|pair| !pair.is_empty())
            .find_map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_component(key) == "poster").then(|| decode_component(value))
            });

        Self { poster }
    }

    /// Any value except empty, `0` and `false` asks for a thumbnail
    pub fn wants_thumbnail(&self) -> bool {
        match self.poster.as_deref().map(str::trim) {
            None | Some("") | Some("0") => false,
            Some(value) => !value.eq_ignore_ascii_case("false"),
        }
    }
}

/// Decode one `application/x-www-form-urlencoded` component
fn decode_component(component: &str) -> String {
    let spaced = component.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned()
}

/// Create the gallery router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Join the percent-decoded segments of `uri_path` onto `root`.
///
/// Segments decode to raw bytes, so on-disk names that are not UTF-8 stay
/// reachable. Dot segments and segments that smuggle a separator are
/// rejected as not found, so the result never leaves `root`.
pub fn resolve_path(root: &Path, uri_path: &str) -> Result<PathBuf, RouteError> {
    let mut resolved = root.to_path_buf();

    for raw in uri_path.split('/').filter(|s| !s.is_empty()) {
        let segment = urlencoding::decode_binary(raw.as_bytes());

        if escapes_root(&segment) {
            warn!(path = uri_path, "Rejected path escaping the root");
            return Err(RouteError::NotFound);
        }

        resolved.push(segment_to_os(segment)?);
    }

    Ok(resolved)
}

fn escapes_root(segment: &[u8]) -> bool {
    segment == b".."
        || segment == b"."
        || segment.iter().any(|&b| matches!(b, b'/' | b'\\' | 0))
}

#[cfg(unix)]
fn segment_to_os(segment: Cow<'_, [u8]>) -> Result<OsString, RouteError> {
    use std::os::unix::ffi::OsStringExt;
    Ok(OsString::from_vec(segment.into_owned()))
}

#[cfg(not(unix))]
fn segment_to_os(segment: Cow<'_, [u8]>) -> Result<OsString, RouteError> {
    String::from_utf8(segment.into_owned())
        .map(OsString::from)
        .map_err(|_| {
            debug!("Segment is not valid UTF-8 once decoded");
            RouteError::NotFound
        })
}

/// Universal handler for every method and path
#[instrument(skip_all, fields(path = %uri.path()))]
async fn handle_request(
    State(state): State<AppState>,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Result<Response, RouteError> {
    let path = resolve_path(&state.root, uri.path())?;

    // existence is checked again by every later open
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(e) => {
            debug!(resolved = %path.display(), error = %e, "Path not found");
            return Err(RouteError::NotFound);
        }
    };

    if metadata.is_dir() {
        return render_directory(&state, &path, uri.path()).await;
    }

    if !metadata.is_file() {
        return Err(RouteError::NotFound);
    }

    let query = FileQuery::parse(query.as_deref());
    if query.wants_thumbnail() {
        let category = sniff(&path, state.listing.sniff_bytes).await;
        if category == MediaCategory::Video {
            let thumbnail = state.thumbnails.extract(&path).await?;
            return Ok(thumbnail.into_response());
        }
        debug!(category = category.as_str(), "Thumbnail requested for non-video, serving file");
    }

    stream_file(&path, state.listing.stream_chunk_bytes).await
}

async fn render_directory(
    state: &AppState,
    dir: &Path,
    request_path: &str,
) -> Result<Response, RouteError> {
    let listing = list_directory(dir, &state.listing).await?;

    let base_href = if request_path.ends_with('/') {
        request_path.to_string()
    } else {
        format!("{request_path}/")
    };
    let title = String::from_utf8_lossy(&urlencoding::decode_binary(base_href.as_bytes()))
        .into_owned();

    Ok(Html(render_page(&title, &base_href, &listing).into_string()).into_response())
}

/// Stream a file's bytes as they are read; dropping the body closes the file.
async fn stream_file(path: &Path, chunk_bytes: usize) -> Result<Response, RouteError> {
    let file = tokio::fs::File::open(path).await?;
    let stream = ReaderStream::with_capacity(file, chunk_bytes);

    metrics::counter!("gallery_files_streamed_total").increment(1);
    Ok(Response::new(Body::from_stream(stream)))
}

/// Bind the listener and serve until `shutdown` resolves
pub async fn start_server(
    state: AppState,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state.clone());
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!(
        address = %addr,
        root = %state.root.display(),
        url = %net::reachable_url(config.port),
        "Gallery gateway listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Gallery server error")?;

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ThumbnailConfig;
    use crate::probe::fixtures::{MP3_HEADER, MP4_HEADER};
    use crate::thumbnail::test_support::fake_extractor;
    use axum::http::{header, Method, Request};
    use tower::ServiceExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        app: Router,
    }

    /// root/
    ///   Movies/
    ///   song.mp3
    ///   clip.mp4
    ///   notes.txt
    ///   my song.mp3
    /// secret.txt (outside the root)
    fn fixture(extractor_script: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("Movies")).unwrap();
        std::fs::write(root.join("song.mp3"), MP3_HEADER).unwrap();
        std::fs::write(root.join("clip.mp4"), MP4_HEADER).unwrap();
        std::fs::write(root.join("notes.txt"), b"plain text").unwrap();
        std::fs::write(root.join("my song.mp3"), MP3_HEADER).unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"top secret").unwrap();

        let program = fake_extractor(dir.path(), extractor_script);
        let config = Config {
            thumbnail: ThumbnailConfig {
                program,
                ..ThumbnailConfig::default()
            },
            ..Config::default()
        };

        let app = create_router(AppState::new(root.clone(), &config));
        Fixture {
            _dir: dir,
            root,
            app,
        }
    }

    async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, body.to_vec())
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        send(app, Method::GET, uri).await
    }

    #[test]
    fn test_wants_thumbnail() {
        let query = |v: Option<&str>| FileQuery {
            poster: v.map(String::from),
        };
        assert!(query(Some("1")).wants_thumbnail());
        assert!(query(Some("true")).wants_thumbnail());
        assert!(query(Some("yes")).wants_thumbnail());
        assert!(!query(None).wants_thumbnail());
        assert!(!query(Some("")).wants_thumbnail());
        assert!(!query(Some("0")).wants_thumbnail());
        assert!(!query(Some("FALSE")).wants_thumbnail());
    }

    #[test]
    fn test_parse_query() {
        assert_eq!(FileQuery::parse(None).poster, None);
        assert_eq!(FileQuery::parse(Some("")).poster, None);
        assert_eq!(FileQuery::parse(Some("t=3&poster=1")).poster.as_deref(), Some("1"));
        assert_eq!(FileQuery::parse(Some("poster")).poster.as_deref(), Some(""));
        assert_eq!(FileQuery::parse(Some("poster=a+b%21")).poster.as_deref(), Some("a b!"));
        // repeated markers keep the first value instead of dropping the query
        assert_eq!(
            FileQuery::parse(Some("poster=1&poster=0")).poster.as_deref(),
            Some("1")
        );
        assert!(FileQuery::parse(Some("poster=1&poster=1")).wants_thumbnail());
    }

    #[test]
    fn test_resolve_decodes_each_segment() {
        let root = Path::new("/srv/media");
        assert_eq!(
            resolve_path(root, "/Movies//my%20clip.mp4").unwrap(),
            PathBuf::from("/srv/media/Movies/my clip.mp4")
        );
        assert_eq!(resolve_path(root, "/").unwrap(), PathBuf::from("/srv/media"));
    }

    #[test]
    fn test_resolve_keeps_non_utf8_bytes() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let root = Path::new("/srv/media");
        assert_eq!(
            resolve_path(root, "/caf%E9.txt").unwrap(),
            root.join(OsStr::from_bytes(b"caf\xe9.txt"))
        );
    }

    #[test]
    fn test_resolve_rejects_escaping_segments() {
        let root = Path::new("/srv/media");
        for path in [
            "/%2E%2E/secret.txt",
            "/./notes.txt",
            "/Movies/../../etc/passwd",
            "/..%2F..%2Fetc%2Fpasswd",
            "/%2Fetc%2Fpasswd",
            "/a%5Cb",
            "/nul%00byte",
        ] {
            assert!(
                matches!(resolve_path(root, path), Err(RouteError::NotFound)),
                "{path} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_path_is_404_with_empty_body() {
        let f = fixture("exit 0");
        let (status, _, body) = get(&f.app, "/missing.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_traversal_is_404() {
        let f = fixture("exit 0");
        let (status, _, body) = get(&f.app, "/%2E%2E/secret.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_index_page_lists_children() {
        let f = fixture("exit 0");
        let (status, content_type, body) = get(&f.app, "/").await;
        let page = String::from_utf8(body).unwrap();

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/html"));
        assert!(page.contains(r#"href="./Movies/""#));
        assert!(page.contains(r#"<audio data-src="./song.mp3""#));
        assert!(page.contains(r#"data-poster="./clip.mp4?poster=1""#));
        assert!(page.contains(r#"<a href="./notes.txt">notes.txt</a>"#));
        assert!(page.contains(r#"data-src="./my%20song.mp3""#));
        assert!(page.contains(r#"<a href="../">../</a>"#));
        assert!(page.contains("IntersectionObserver"));
    }

    #[tokio::test]
    async fn test_directory_without_slash_gets_base_href() {
        let f = fixture("exit 0");
        let (status, _, body) = get(&f.app, "/Movies").await;
        let page = String::from_utf8(body).unwrap();

        assert_eq!(status, StatusCode::OK);
        assert!(page.contains(r#"<base href="/Movies/">"#));
    }

    #[tokio::test]
    async fn test_file_bytes_are_identical() {
        let f = fixture("exit 0");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(f.root.join("Movies").join("blob.bin"), &data).unwrap();

        let (status, content_type, body) = get(&f.app, "/Movies/blob.bin").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, None);
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn test_video_without_marker_streams_raw_bytes() {
        let f = fixture("printf 'JPEGDATA'");
        let (status, _, body) = get(&f.app, "/clip.mp4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len() as u64, std::fs::metadata(f.root.join("clip.mp4")).unwrap().len());
        assert_eq!(body, MP4_HEADER);
    }

    #[tokio::test]
    async fn test_encoded_name_resolves() {
        let f = fixture("exit 0");
        let (status, _, body) = get(&f.app, "/my%20song.mp3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, MP3_HEADER);
    }

    #[tokio::test]
    async fn test_poster_returns_extracted_image() {
        let f = fixture("printf 'JPEGDATA'");
        let (status, content_type, body) = get(&f.app, "/clip.mp4?poster=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(body, b"JPEGDATA");
    }

    #[tokio::test]
    async fn test_non_utf8_name_is_reachable_from_listing() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let f = fixture("exit 0");
        let name = OsStr::from_bytes(b"caf\xe9.txt");
        std::fs::write(f.root.join(name), b"bonjour").unwrap();

        let (status, _, body) = get(&f.app, "/").await;
        assert_eq!(status, StatusCode::OK);
        let page = String::from_utf8(body).unwrap();
        let href = r#"href="./caf%E9.txt""#;
        assert!(page.contains(href), "listing should link the raw name");

        let (status, _, body) = get(&f.app, "/caf%E9.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"bonjour");
    }

    #[tokio::test]
    async fn test_repeated_poster_still_extracts() {
        let f = fixture("printf 'JPEGDATA'");
        let (status, content_type, body) = get(&f.app, "/clip.mp4?poster=1&poster=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(body, b"JPEGDATA");
    }

    #[tokio::test]
    async fn test_poster_failure_is_500() {
        let f = fixture("echo 'invalid data found' >&2\nexit 2");
        let (status, _, body) = get(&f.app, "/clip.mp4?poster=1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(String::from_utf8(body).unwrap(), "Error generating image");
    }

    #[tokio::test]
    async fn test_poster_on_non_video_serves_file() {
        let f = fixture("exit 2");
        let (status, _, body) = get(&f.app, "/notes.txt?poster=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"plain text");
    }

    #[tokio::test]
    async fn test_falsy_poster_serves_file() {
        let f = fixture("exit 2");
        let (status, _, body) = get(&f.app, "/clip.mp4?poster=0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, MP4_HEADER);
    }

    #[tokio::test]
    async fn test_any_method_is_handled() {
        let f = fixture("exit 0");
        let (status, _, body) = send(&f.app, Method::POST, "/notes.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"plain text");
    }
}
