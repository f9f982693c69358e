use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upload queue tuning.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum number of simultaneous in-flight uploads.
    pub concurrency: usize,
    /// Retries after the initial attempt before a job becomes terminal.
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt.
    pub retry_delay_ms: u64,
    /// Cap on the backoff delay.
    pub max_retry_delay_ms: u64,
    /// Per-attempt transport timeout.
    pub timeout_ms: u64,
    /// Largest accepted chunk payload.
    pub max_chunk_bytes: u64,
    /// Report a session's delivery as failed on its first terminal chunk
    /// instead of waiting until every chunk has failed.
    pub fail_session_on_any_terminal: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            timeout_ms: 30_000,
            max_chunk_bytes: 500 * 1024 * 1024,
            fail_session_on_any_terminal: false,
        }
    }
}

impl UploadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Durable session snapshot settings.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory holding the per-profile session record. Falls back to
    /// `CAPTURE_RELAY_DATA_DIR`, then the current directory.
    pub data_dir: Option<PathBuf>,
    /// Records older than this are never offered for recovery.
    pub staleness_minutes: u64,
    /// Records younger than this may be resumed without asking.
    pub auto_recover_minutes: u64,
    /// Minimum spacing between throttled snapshot writes.
    pub throttle_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            staleness_minutes: 30,
            auto_recover_minutes: 2,
            throttle_secs: 5,
        }
    }
}

impl PersistenceConfig {
    /// Longest recovery window `validate` accepts: one week.
    pub const MAX_WINDOW_MINUTES: u64 = 7 * 24 * 60;
    /// Snapshots written through the throttle are at least this far apart.
    pub const MIN_THROTTLE_SECS: u64 = 5;

    pub fn staleness(&self) -> chrono::Duration {
        Self::minutes(self.staleness_minutes)
    }

    pub fn auto_recover_window(&self) -> chrono::Duration {
        Self::minutes(self.auto_recover_minutes)
    }

    /// Saturates instead of overflowing for unvalidated configs.
    fn minutes(minutes: u64) -> chrono::Duration {
        i64::try_from(minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_secs(self.throttle_secs)
    }
}

/// Capture lifecycle timing.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interval of the duration clock tick.
    pub tick_interval_ms: u64,
    /// A duration change at least this large triggers a snapshot.
    pub persist_threshold_secs: u64,
    /// How long `stopping` may wait for the facility to flush.
    pub stop_timeout_ms: u64,
    /// Interval at which the facility emits incremental chunks.
    pub timeslice_ms: u64,
    /// Container format of the captured media.
    pub mime_type: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            persist_threshold_secs: 5,
            stop_timeout_ms: 5000,
            timeslice_ms: 5000,
            mime_type: "video/webm".to_string(),
        }
    }
}

impl CaptureConfig {
    pub const ALLOWED_FORMATS: [&'static str; 2] = ["webm", "mp4"];

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn persist_threshold(&self) -> Duration {
        Duration::from_secs(self.persist_threshold_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms)
    }

    /// File extension matching `mime_type`, e.g. `webm` for `video/webm;codecs=vp9`.
    pub fn extension(&self) -> &str {
        self.mime_type
            .split(';')
            .next()
            .and_then(|m| m.split('/').nth(1))
            .map(str::trim)
            .unwrap_or("bin")
    }
}

#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Chunks are posted to the backend, which forwards them to storage.
    Backend,
    /// The backend hands out a signed URL and chunks go straight to storage.
    SignedUrl,
    /// Chunks are written to a local directory.
    File,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Backend API root for the HTTP strategies.
    pub base_url: Option<String>,
    /// Bearer token sent with every HTTP request.
    pub auth_token: Option<String>,
    /// Target directory for the file strategy.
    pub directory: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::File,
            base_url: None,
            auth_token: None,
            directory: None,
        }
    }
}
