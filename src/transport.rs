//! Transport adapters
//!
//! The upload queue hands every attempt to a [`Transport`]: an async
//! `(session_id, payload, chunk_index) -> Ack` call. Strategies can be
//! swapped without touching queue logic.
//!
//! Components:
//! - `adapter`: the `Transport` trait, `Ack`, and the closure adapter `from_fn`.
//! - `http_transport`: backend-proxy and signed-URL delivery over HTTP.
//! - `file_transport`: delivery into a local directory.

pub mod adapter;
pub mod file_transport;
pub mod http_transport;

use std::sync::Arc;

use crate::configuration::config::Config;
use crate::configuration::types::TransportKind;
use crate::error_handling::types::ConfigError;

pub use adapter::{from_fn, Ack, CompletionSummary, FnTransport, Transport};
pub use file_transport::FileTransport;
pub use http_transport::{HttpStrategy, HttpTransport};

/// Builds the transport selected by `config.transport.kind`.
pub fn from_config(config: &Config) -> Result<Arc<dyn Transport>, ConfigError> {
    match config.transport.kind {
        TransportKind::File => Ok(Arc::new(FileTransport::new(
            config.chunk_dir()?,
            config.capture.extension(),
        ))),
        TransportKind::Backend | TransportKind::SignedUrl => Ok(Arc::new(
            HttpTransport::from_config(&config.transport, &config.capture.mime_type)?,
        )),
    }
}
