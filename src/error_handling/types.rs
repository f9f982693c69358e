use std::fmt;

use uuid::Uuid;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    NotInRange(String),
    InvalidValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::InvalidValue(e) => write!(f, "Invalid value: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Failures of the durable session store. Persistence is best-effort: callers
/// log these and carry on.
#[derive(Debug)]
pub enum PersistenceError {
    ReadFailed(String),
    WriteFailed(String),
    Serialization(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::ReadFailed(e) => write!(f, "Session store read failed: {}", e),
            PersistenceError::WriteFailed(e) => write!(f, "Session store write failed: {}", e),
            PersistenceError::Serialization(e) => write!(f, "Session record serialization failed: {}", e),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Any failure of a single upload attempt. All variants are retryable by the
/// queue; the distinction only matters for logs.
#[derive(Debug)]
pub enum TransportError {
    Network(String),
    Status { code: u16, body: String },
    Timeout(u64),
    InvalidResponse(String),
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Network(e) => write!(f, "Network error: {}", e),
            TransportError::Status { code, body } => {
                write!(f, "Upload rejected with status {}: {}", code, body)
            }
            TransportError::Timeout(ms) => write!(f, "Upload timed out after {}ms", ms),
            TransportError::InvalidResponse(e) => write!(f, "Invalid upload response: {}", e),
            TransportError::Io(e) => write!(f, "Transport IO error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Network(format!("request timed out: {}", err))
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    EmptyPayload,
    PayloadTooLarge { size: u64, max: u64 },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::EmptyPayload => write!(f, "Refusing to enqueue an empty chunk"),
            QueueError::PayloadTooLarge { size, max } => {
                write!(f, "Chunk of {} bytes exceeds the {} byte limit", size, max)
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// Classification of a failed capture-permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionErrorKind {
    Denied,
    Unsupported,
    NoSource,
    Aborted,
    Other,
}

impl PermissionErrorKind {
    /// Maps the error names reported by capture hosts (DOM exception names for
    /// browser-backed hosts) onto a classification.
    pub fn from_host_error_name(name: &str) -> Self {
        match name {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
                PermissionErrorKind::Denied
            }
            "NotSupportedError" | "TypeError" => PermissionErrorKind::Unsupported,
            "NotFoundError" | "DevicesNotFoundError" | "OverconstrainedError" => {
                PermissionErrorKind::NoSource
            }
            "AbortError" => PermissionErrorKind::Aborted,
            _ => PermissionErrorKind::Other,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            PermissionErrorKind::Denied => {
                "Screen recording permission was denied. Allow screen sharing and try again."
            }
            PermissionErrorKind::Unsupported => {
                "Screen recording is not supported in this environment."
            }
            PermissionErrorKind::NoSource => "No screen or window is available to record.",
            PermissionErrorKind::Aborted => "Screen selection was cancelled.",
            PermissionErrorKind::Other => "Screen recording could not be started.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionError {
    pub kind: PermissionErrorKind,
    pub detail: String,
}

impl PermissionError {
    pub fn new(kind: PermissionErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Builds an error from a host-reported error name and message.
    pub fn from_host(name: &str, detail: impl Into<String>) -> Self {
        Self::new(PermissionErrorKind::from_host_error_name(name), detail)
    }
}

impl fmt::Display for PermissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind.user_message())
        } else {
            write!(f, "{} ({})", self.kind.user_message(), self.detail)
        }
    }
}

impl std::error::Error for PermissionError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    Permission(PermissionError),
    InvalidStream(String),
    AlreadyActive(Uuid),
    Facility(String),
    Queue(QueueError),
}

impl CaptureError {
    /// Whether a fresh `start_recording()` may succeed without the user
    /// changing anything. An invalid stream never is.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CaptureError::InvalidStream(_))
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Permission(e) => write!(f, "Capture permission error: {}", e),
            CaptureError::InvalidStream(e) => write!(f, "Invalid capture stream: {}", e),
            CaptureError::AlreadyActive(id) => {
                write!(f, "Capture session {} is already active", id)
            }
            CaptureError::Facility(e) => write!(f, "Capture facility error: {}", e),
            CaptureError::Queue(e) => write!(f, "Capture upload error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<PermissionError> for CaptureError {
    fn from(err: PermissionError) -> Self {
        CaptureError::Permission(err)
    }
}

impl From<QueueError> for CaptureError {
    fn from(err: QueueError) -> Self {
        CaptureError::Queue(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_error_names_are_classified() {
        assert_eq!(
            PermissionErrorKind::from_host_error_name("NotAllowedError"),
            PermissionErrorKind::Denied
        );
        assert_eq!(
            PermissionErrorKind::from_host_error_name("NotSupportedError"),
            PermissionErrorKind::Unsupported
        );
        assert_eq!(
            PermissionErrorKind::from_host_error_name("NotFoundError"),
            PermissionErrorKind::NoSource
        );
        assert_eq!(
            PermissionErrorKind::from_host_error_name("AbortError"),
            PermissionErrorKind::Aborted
        );
        assert_eq!(
            PermissionErrorKind::from_host_error_name("SomethingElse"),
            PermissionErrorKind::Other
        );
    }

    #[test]
    fn invalid_stream_is_not_retryable() {
        assert!(!CaptureError::InvalidStream("no tracks".into()).is_retryable());
        assert!(CaptureError::Facility("encoder crashed".into()).is_retryable());
        let denied = PermissionError::from_host("NotAllowedError", "user dismissed");
        assert!(CaptureError::from(denied.clone()).is_retryable());
        assert!(denied.to_string().contains("denied"));
    }
}
