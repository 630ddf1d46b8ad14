//! On-demand video thumbnails.
//!
//! Each request gets its own [`ThumbnailSession`]: one external frame
//! extraction process whose stdout is relayed to the client chunk by chunk.
//! Sessions are bounded by a semaphore and by a deadline, and the process is
//! killed as soon as the session is dropped, which is what happens when the
//! client disconnects mid-stream.
//!
//! ```text
//! request -> slot (semaphore) -> spawn -> prime (first_flush_bytes) -> stream -> exit status
//!                                            |
//!                                            +-> EOF before threshold: complete body or 500
//! ```

use crate::config::ThumbnailConfig;
use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Read size for relaying extractor output
const CHUNK_BYTES: usize = 16 * 1024;

/// Number of stderr lines kept for the failure log
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the stderr drain once the process is gone
const STDERR_GRACE: Duration = Duration::from_millis(500);

/// Errors that can occur while extracting a thumbnail.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on extractor output: {0}")]
    Io(#[from] io::Error),

    #[error("Extractor exited with {status}")]
    Failed { status: ExitStatus },

    #[error("Extractor exited successfully without producing an image")]
    EmptyOutput,

    #[error("Extraction timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Extractor is shutting down")]
    Unavailable,
}

/// Terminal status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Succeeded,
    Failed,
    /// The client went away before the extractor finished
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Succeeded => "succeeded",
            SessionStatus::Failed => "failed",
            SessionStatus::Abandoned => "abandoned",
        }
    }
}

/// A thumbnail ready to be sent; the body may still be streaming.
pub struct Thumbnail {
    pub content_type: String,
    pub body: Body,
}

impl IntoResponse for Thumbnail {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

/// Spawns frame extraction processes, at most `max_concurrent` at a time.
pub struct ThumbnailExtractor {
    config: ThumbnailConfig,
    slots: Arc<Semaphore>,
}

impl ThumbnailExtractor {
    pub fn new(config: ThumbnailConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self { config, slots }
    }

    /// Number of extraction slots currently free
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Refuse new extractions; sessions already running are unaffected.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Command line for one extraction: a single frame picked from the
    /// configured window, encoded as one image on stdout.
    pub fn args(&self, video: &Path) -> Vec<OsString> {
        let select = format!(
            "select='between(t,{},{})'",
            self.config.window_start_secs, self.config.window_end_secs
        );

        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(video.as_os_str().to_owned());
        args.extend(
            [
                "-vf",
                select.as_str(),
                "-frames:v",
                "1",
                "-an",
                "-sn",
                "-f",
                "image2pipe",
                "-c:v",
                "mjpeg",
                "-",
            ]
            .iter()
            .map(OsString::from),
        );
        args
    }

    /// Extract a thumbnail for `video`.
    ///
    /// An error is returned only while nothing has been handed to the client.
    /// Once the body streams, a late failure aborts the body instead.
    #[instrument(skip(self, video), fields(path = %video.display()))]
    pub async fn extract(&self, video: &Path) -> Result<Thumbnail, ExtractionError> {
        let session = ThumbnailSession::start(self, video).await?;

        let body = match session.prime(self.config.first_flush_bytes).await? {
            Primed::Complete(image) => Body::from(image),
            Primed::Streaming { head, session } => Body::from_stream(relay(head, session)),
        };

        Ok(Thumbnail {
            content_type: self.config.content_type.clone(),
            body,
        })
    }
}

enum Primed {
    /// The process finished before the first flush
    Complete(Bytes),
    /// The first flush is ready, the rest follows from the session
    Streaming { head: Bytes, session: ThumbnailSession },
}

/// One extraction process, owned by the request that started it.
pub struct ThumbnailSession {
    path: PathBuf,
    child: Child,
    stdout: ChildStdout,
    stderr_tail: Option<JoinHandle<Vec<String>>>,
    started: Instant,
    deadline: Instant,
    timeout: Duration,
    sent_bytes: usize,
    status: Option<SessionStatus>,
    _slot: OwnedSemaphorePermit,
}

impl ThumbnailSession {
    /// Wait for a slot, then spawn the extraction process.
    ///
    /// The deadline starts before the slot is acquired.
    async fn start(
        extractor: &ThumbnailExtractor,
        video: &Path,
    ) -> Result<Self, ExtractionError> {
        let config = &extractor.config;
        let timeout = config.timeout();
        let started = Instant::now();
        let deadline = started + timeout;

        let slot = match tokio::time::timeout_at(deadline, extractor.slots.clone().acquire_owned())
            .await
        {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => return Err(ExtractionError::Unavailable),
            Err(_) => {
                warn!("No extraction slot freed up before the deadline");
                record(SessionStatus::Failed, started);
                return Err(ExtractionError::TimedOut(timeout));
            }
        };

        let mut child = Command::new(&config.program)
            .args(extractor.args(video))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                error!(program = %config.program, error = %source, "Failed to spawn extractor");
                record(SessionStatus::Failed, started);
                ExtractionError::Spawn {
                    program: config.program.clone(),
                    source,
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "extractor stdout not captured"))?;
        let stderr_tail = child.stderr.take().map(|stderr| tokio::spawn(drain_stderr(stderr)));

        metrics::gauge!("gallery_thumbnails_in_flight").increment(1.0);
        debug!(pid = ?child.id(), "Extractor spawned");

        Ok(Self {
            path: video.to_path_buf(),
            child,
            stdout,
            stderr_tail,
            started,
            deadline,
            timeout,
            sent_bytes: 0,
            status: None,
            _slot: slot,
        })
    }

    /// Buffer up to `threshold` bytes before anything reaches the client, so
    /// that a process failing early still gets a clean error response.
    async fn prime(mut self, threshold: usize) -> Result<Primed, ExtractionError> {
        let mut head = BytesMut::with_capacity(threshold);

        while head.len() < threshold {
            let n = match self.read_chunk(&mut head).await {
                Ok(n) => n,
                Err(e) => return Err(self.fail(e).await),
            };

            if n == 0 {
                if let Err(e) = self.wait().await {
                    return Err(self.fail(e).await);
                }
                if head.is_empty() {
                    return Err(self.fail(ExtractionError::EmptyOutput).await);
                }
                self.sent_bytes = head.len();
                self.succeed();
                return Ok(Primed::Complete(head.freeze()));
            }
        }

        self.sent_bytes = head.len();
        Ok(Primed::Streaming {
            head: head.freeze(),
            session: self,
        })
    }

    async fn read_chunk(&mut self, buf: &mut BytesMut) -> Result<usize, ExtractionError> {
        match tokio::time::timeout_at(self.deadline, self.stdout.read_buf(buf)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(ExtractionError::TimedOut(self.timeout)),
        }
    }

    async fn wait(&mut self) -> Result<(), ExtractionError> {
        let status = match tokio::time::timeout_at(self.deadline, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => return Err(ExtractionError::TimedOut(self.timeout)),
        };

        if status.success() {
            Ok(())
        } else {
            Err(ExtractionError::Failed { status })
        }
    }

    fn succeed(&mut self) {
        self.status = Some(SessionStatus::Succeeded);
        record(SessionStatus::Succeeded, self.started);
        info!(
            path = %self.path.display(),
            bytes = self.sent_bytes,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Thumbnail generated"
        );
    }

    /// Kill the process, log the failure with the stderr tail, and hand the
    /// error back.
    async fn fail(&mut self, err: ExtractionError) -> ExtractionError {
        let _ = self.child.start_kill();
        self.status = Some(SessionStatus::Failed);
        record(SessionStatus::Failed, self.started);

        let stderr = match self.stderr_tail.take() {
            Some(task) => match tokio::time::timeout(STDERR_GRACE, task).await {
                Ok(Ok(lines)) => lines.join("\n"),
                _ => String::new(),
            },
            None => String::new(),
        };

        error!(
            path = %self.path.display(),
            error = %err,
            bytes_sent = self.sent_bytes,
            stderr = %stderr,
            "Thumbnail extraction failed"
        );
        err
    }

    /// Kill the process of a session whose body was dropped mid-stream.
    fn abandon(&mut self) {
        let _ = self.child.start_kill();
        self.status = Some(SessionStatus::Abandoned);
        record(SessionStatus::Abandoned, self.started);
        info!(
            path = %self.path.display(),
            bytes_sent = self.sent_bytes,
            "Thumbnail request abandoned, extractor terminated"
        );
    }
}

impl Drop for ThumbnailSession {
    fn drop(&mut self) {
        metrics::gauge!("gallery_thumbnails_in_flight").decrement(1.0);

        if self.status.is_none() {
            self.abandon();
        }
    }
}

enum RelayState {
    Head(Bytes, ThumbnailSession),
    Body(ThumbnailSession),
    Done,
}

/// Turn a primed session into a body stream: the primed head first, then
/// stdout chunks in arrival order. A failure after the head ends the stream
/// with an error, which aborts the response.
fn relay(head: Bytes, session: ThumbnailSession) -> impl Stream<Item = io::Result<Bytes>> + Send {
    stream::unfold(RelayState::Head(head, session), |state| async move {
        match state {
            RelayState::Head(head, session) => Some((Ok(head), RelayState::Body(session))),
            RelayState::Body(mut session) => {
                let mut chunk = BytesMut::with_capacity(CHUNK_BYTES);
                let outcome = match session.read_chunk(&mut chunk).await {
                    Ok(0) => session.wait().await.map(|_| None),
                    Ok(n) => Ok(Some(n)),
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(Some(n)) => {
                        session.sent_bytes += n;
                        Some((Ok(chunk.freeze()), RelayState::Body(session)))
                    }
                    Ok(None) => {
                        session.succeed();
                        None
                    }
                    Err(e) => {
                        let err = session.fail(e).await;
                        Some((
                            Err(io::Error::new(io::ErrorKind::Other, err)),
                            RelayState::Done,
                        ))
                    }
                }
            }
            RelayState::Done => None,
        }
    })
}

/// Consume the extractor's stderr so it never blocks on a full pipe.
async fn drain_stderr(stderr: ChildStderr) -> Vec<String> {
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line).trim_end().to_string();
                if text.is_empty() {
                    continue;
                }
                debug!(line = %text, "extractor stderr");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(text);
            }
            Err(e) => {
                debug!(error = %e, "Stopped reading extractor stderr");
                break;
            }
        }
    }

    tail.into()
}

fn record(status: SessionStatus, started: Instant) {
    metrics::counter!("gallery_thumbnails_total", "status" => status.as_str()).increment(1);
    metrics::histogram!("gallery_thumbnail_seconds").record(started.elapsed().as_secs_f64());
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Write an executable shell script standing in for the extraction
    /// program and return its path.
    pub fn fake_extractor(dir: &Path, script: &str) -> String {
        let path = dir.join("fake-extractor");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }
}
