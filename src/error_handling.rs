//! Error taxonomy shared by every subsystem.
//!
//! Permission and capture-integrity errors surface to the caller with a
//! specific classification, transport errors feed the upload retry path, and
//! persistence errors are logged and swallowed by their callers.

pub mod types;

pub use types::{
    CaptureError, ConfigError, PermissionError, PermissionErrorKind, PersistenceError,
    QueueError, TransportError,
};
