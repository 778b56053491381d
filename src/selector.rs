//! External selector collaborator: scheduling, run polling, batch download.
//!
//! The selection service itself (balancing, diversity, uncertainty sampling)
//! is fully delegated; only the request/response contract lives here. Polling
//! is an explicit suspension point with an injected clock and a cancellation
//! token so an operator-driven abort is possible even though the default
//! policy waits indefinitely.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::fsio;
use crate::selection::{SelectionError, SelectionRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for a downloaded sample image.
const MAX_IMAGE_BYTES: u64 = 32 * 1024 * 1024;

/// Errors raised while talking to the selector service.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("Invalid selector URL {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error(transparent)]
    InvalidRequest(#[from] SelectionError),
    #[error("Selector request to {url} failed: {source}")]
    Http {
        url: String,
        source: Box<ureq::Error>,
    },
    #[error("Malformed selector response from {url}: {source}")]
    Malformed {
        url: String,
        source: std::io::Error,
    },
    /// The run reached a terminal state other than success. Root causes are
    /// typically data or credential misconfiguration, so there is no retry.
    #[error("Selection run {run_id} ended in state {state:?}: {message}")]
    SelectionFailed {
        run_id: String,
        state: RunState,
        message: String,
    },
    #[error("Selection run {run_id} was canceled by the operator")]
    Canceled { run_id: String },
    #[error("Selection run {run_id} did not finish within {elapsed:?}")]
    TimedOut { run_id: String, elapsed: Duration },
}

/// Errors raised while downloading a selected batch.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Failed to download {url}: {source}")]
    Http {
        url: String,
        source: Box<ureq::Error>,
    },
    #[error("Download from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },
    #[error("Downloaded bytes for {file_name} are not a JPEG image")]
    NotAJpeg { file_name: String },
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Handle for a scheduled selector run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: String,
}

/// Lifecycle state reported by the selector for a scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Open,
    Scheduled,
    Started,
    Completed,
    Failed,
    Crashed,
    Canceled,
}

impl RunState {
    /// Whether the run will make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Crashed | RunState::Canceled
        )
    }

    /// Whether a terminal run produced a usable selection.
    pub fn ended_successfully(self) -> bool {
        self == RunState::Completed
    }
}

/// One status update for a scheduled run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunInfo {
    pub state: RunState,
    #[serde(default)]
    pub message: String,
}

/// A sample chosen by a completed selection run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SelectedSample {
    pub file_name: String,
    pub read_url: String,
}

/// The external selection service, reduced to its workflow contract.
pub trait Selector {
    /// Submit a selection request; returns a handle for polling.
    fn schedule(&self, request: &SelectionRequest) -> Result<RunHandle, SelectorError>;
    /// Fetch the current status of a scheduled run.
    fn poll(&self, handle: &RunHandle) -> Result<RunInfo, SelectorError>;
    /// Export the selected batch of a successfully completed run.
    fn export_batch(&self, handle: &RunHandle) -> Result<Vec<SelectedSample>, SelectorError>;
}

/// Time source for the polling loop, injectable for tests.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation used by the binaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Cooperative cancellation flag for operator-driven aborts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How often to poll and how long to wait before giving up.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` waits indefinitely; the service exposes no cancellation contract.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: None,
        }
    }
}

/// Poll a scheduled run until it reaches a terminal state.
///
/// Every state change is logged. An unsuccessful terminal state maps to
/// [`SelectorError::SelectionFailed`]; there is no automatic retry.
pub fn poll_to_completion(
    selector: &dyn Selector,
    handle: &RunHandle,
    policy: &PollPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<RunInfo, SelectorError> {
    let started = clock.now();
    let mut last_state: Option<RunState> = None;
    loop {
        if cancel.is_canceled() {
            return Err(SelectorError::Canceled {
                run_id: handle.run_id.clone(),
            });
        }
        let info = selector.poll(handle)?;
        if last_state != Some(info.state) {
            tracing::info!(
                run_id = %handle.run_id,
                state = ?info.state,
                message = %info.message,
                "Selection run update"
            );
            last_state = Some(info.state);
        }
        if info.state.is_terminal() {
            if info.state.ended_successfully() {
                return Ok(info);
            }
            return Err(SelectorError::SelectionFailed {
                run_id: handle.run_id.clone(),
                state: info.state,
                message: info.message,
            });
        }
        let elapsed = clock.now().duration_since(started);
        if let Some(timeout) = policy.timeout {
            if elapsed >= timeout {
                return Err(SelectorError::TimedOut {
                    run_id: handle.run_id.clone(),
                    elapsed,
                });
            }
        }
        clock.sleep(policy.interval);
    }
}

/// Token-authenticated HTTP implementation of [`Selector`].
pub struct HttpSelector {
    agent: ureq::Agent,
    base_url: Url,
    token: String,
    dataset_id: String,
}

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    run_id: String,
}

impl HttpSelector {
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        dataset_id: impl Into<String>,
    ) -> Result<Self, SelectorError> {
        let parsed = Url::parse(base_url).map_err(|source| SelectorError::InvalidUrl {
            url: base_url.to_string(),
            source,
        })?;
        Ok(Self {
            agent: build_agent(),
            base_url: parsed,
            token: token.into(),
            dataset_id: dataset_id.into(),
        })
    }

    fn runs_url(&self) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/v1/datasets/{}/runs", self.dataset_id)
    }

    fn run_url(&self, run_id: &str) -> String {
        format!("{}/{run_id}", self.runs_url())
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, SelectorError> {
        let response = self
            .agent
            .get(url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .call()
            .map_err(|source| SelectorError::Http {
                url: url.to_string(),
                source: Box::new(source),
            })?;
        response.into_json().map_err(|source| SelectorError::Malformed {
            url: url.to_string(),
            source,
        })
    }
}

impl Selector for HttpSelector {
    fn schedule(&self, request: &SelectionRequest) -> Result<RunHandle, SelectorError> {
        request.validate()?;
        let url = self.runs_url();
        let body = serde_json::json!({ "selection_config": request });
        let response = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(body)
            .map_err(|source| SelectorError::Http {
                url: url.clone(),
                source: Box::new(source),
            })?;
        let scheduled: ScheduleResponse =
            response
                .into_json()
                .map_err(|source| SelectorError::Malformed { url, source })?;
        tracing::info!(run_id = %scheduled.run_id, "Scheduled selection run");
        Ok(RunHandle {
            run_id: scheduled.run_id,
        })
    }

    fn poll(&self, handle: &RunHandle) -> Result<RunInfo, SelectorError> {
        self.get_json(&self.run_url(&handle.run_id))
    }

    fn export_batch(&self, handle: &RunHandle) -> Result<Vec<SelectedSample>, SelectorError> {
        self.get_json(&format!("{}/export", self.run_url(&handle.run_id)))
    }
}

/// Whether `bytes` are a JPEG image.
pub fn is_jpeg(bytes: &[u8]) -> bool {
    matches!(image::guess_format(bytes), Ok(image::ImageFormat::Jpeg))
}

/// Download a selected batch into `dest_dir`, one file per sample.
///
/// Each payload is size-bounded and must carry a JPEG signature; anything else
/// means the read URL points at the wrong object.
pub fn download_batch(batch: &[SelectedSample], dest_dir: &Path) -> Result<usize, DownloadError> {
    std::fs::create_dir_all(dest_dir).map_err(|source| DownloadError::Io {
        path: dest_dir.to_path_buf(),
        source,
    })?;
    let agent = build_agent();
    let mut downloaded = 0usize;
    for sample in batch {
        let response = agent
            .get(&sample.read_url)
            .call()
            .map_err(|source| DownloadError::Http {
                url: sample.read_url.clone(),
                source: Box::new(source),
            })?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_IMAGE_BYTES + 1)
            .read_to_end(&mut bytes)
            .map_err(|source| DownloadError::Io {
                path: dest_dir.join(&sample.file_name),
                source,
            })?;
        if bytes.len() as u64 > MAX_IMAGE_BYTES {
            return Err(DownloadError::TooLarge {
                url: sample.read_url.clone(),
                limit: MAX_IMAGE_BYTES,
            });
        }
        if !is_jpeg(&bytes) {
            return Err(DownloadError::NotAJpeg {
                file_name: sample.file_name.clone(),
            });
        }
        let dest = dest_dir.join(&sample.file_name);
        fsio::write_atomic(&dest, &bytes).map_err(|source| DownloadError::Io {
            path: dest,
            source,
        })?;
        downloaded += 1;
    }
    tracing::info!(downloaded, "Downloaded selected batch to {}", dest_dir.display());
    Ok(downloaded)
}

fn build_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .timeout_read(READ_TIMEOUT)
        .timeout_write(WRITE_TIMEOUT)
        .build()
}
