use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error_handling::types::TransportError;

/// Acknowledgement of a delivered chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub chunk_index: u64,
    /// Where the chunk ended up (object key, URL, or file path), if known.
    pub location: Option<String>,
}

impl Ack {
    pub fn new(chunk_index: u64) -> Self {
        Self {
            chunk_index,
            location: None,
        }
    }

    pub fn with_location(chunk_index: u64, location: impl Into<String>) -> Self {
        Self {
            chunk_index,
            location: Some(location.into()),
        }
    }
}

/// Final facts about a capture, reported once its last chunk was handed off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub duration_seconds: u64,
    pub total_file_size_bytes: u64,
    pub chunk_count: u64,
}

/// Performs the network call behind one upload attempt.
///
/// Implementations report every failure as an `Err`, whatever its cause, so
/// the queue's retry path treats network errors, rejections and timeouts
/// alike. They never panic on a failed request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn upload(
        &self,
        session_id: Uuid,
        payload: Bytes,
        chunk_index: u64,
    ) -> Result<Ack, TransportError>;

    /// Tells the backend a capture is complete. Most strategies have nothing
    /// to do here.
    async fn finalize(
        &self,
        _session_id: Uuid,
        _summary: &CompletionSummary,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "transport"
    }
}

/// Adapts an async closure into a [`Transport`].
pub struct FnTransport<F> {
    f: F,
}

/// Wraps `f(session_id, payload, chunk_index)` as a transport.
///
/// ```
/// use capture_relay::transport::{from_fn, Ack};
///
/// let transport = from_fn(|_session, _payload, index| async move { Ok(Ack::new(index)) });
/// # let _ = transport;
/// ```
pub fn from_fn<F, Fut>(f: F) -> FnTransport<F>
where
    F: Fn(Uuid, Bytes, u64) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Ack, TransportError>> + Send,
{
    FnTransport { f }
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Uuid, Bytes, u64) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Ack, TransportError>> + Send,
{
    async fn upload(
        &self,
        session_id: Uuid,
        payload: Bytes,
        chunk_index: u64,
    ) -> Result<Ack, TransportError> {
        (self.f)(session_id, payload, chunk_index).await
    }

    fn name(&self) -> &'static str {
        "fn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_transport_forwards_arguments() {
        let session = Uuid::new_v4();
        let transport = from_fn(move |sid, payload: Bytes, index| async move {
            if sid == session && payload.as_ref() == b"abc" {
                Ok(Ack::with_location(index, "ok"))
            } else {
                Err(TransportError::InvalidResponse("unexpected arguments".into()))
            }
        });

        let ack = transport
            .upload(session, Bytes::from_static(b"abc"), 7)
            .await
            .unwrap();
        assert_eq!(ack, Ack::with_location(7, "ok"));
        assert!(transport
            .finalize(
                session,
                &CompletionSummary {
                    duration_seconds: 1,
                    total_file_size_bytes: 3,
                    chunk_count: 1
                }
            )
            .await
            .is_ok());
    }
}
