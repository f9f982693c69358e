//! HTTP delivery strategies.
//!
//! `BackendProxy` posts each chunk to the backend, which forwards it to
//! object storage. `SignedUrl` asks the backend for a short-lived upload URL
//! and puts the chunk directly to storage. Both share the completion call.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::configuration::types::{TransportConfig, TransportKind};
use crate::error_handling::types::{ConfigError, TransportError};

use super::adapter::{Ack, CompletionSummary, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStrategy {
    BackendProxy,
    SignedUrl,
}

#[derive(Debug, Deserialize)]
struct UploadUrlResponse {
    upload_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkUploadResponse {
    #[serde(default)]
    chunk_id: Option<String>,
    #[serde(default)]
    file_path: Option<String>,
}

pub struct HttpTransport {
    base_url: String,
    strategy: HttpStrategy,
    auth_token: Option<String>,
    content_type: String,
    client: Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, strategy: HttpStrategy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            strategy,
            auth_token: None,
            content_type: "application/octet-stream".to_string(),
            client: Client::new(),
        }
    }

    pub fn from_config(config: &TransportConfig, content_type: &str) -> Result<Self, ConfigError> {
        let strategy = match config.kind {
            TransportKind::Backend => HttpStrategy::BackendProxy,
            TransportKind::SignedUrl => HttpStrategy::SignedUrl,
            TransportKind::File => {
                return Err(ConfigError::InvalidValue(
                    "file transport is not an HTTP strategy".to_string(),
                ))
            }
        };
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            ConfigError::InvalidValue("transport.base_url is required".to_string())
        })?;

        let mut transport = Self::new(base_url, strategy);
        transport.auth_token = config.auth_token.clone();
        transport.content_type = content_type.to_string();
        Ok(transport)
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn strategy(&self) -> HttpStrategy {
        self.strategy
    }

    fn recording_url(&self, session_id: Uuid) -> String {
        format!("{}/api/v1/recordings/{}", self.base_url, session_id)
    }

    pub fn chunk_url(&self, session_id: Uuid, chunk_index: u64) -> String {
        format!(
            "{}/chunks?chunk_index={}",
            self.recording_url(session_id),
            chunk_index
        )
    }

    pub fn upload_url_endpoint(&self, session_id: Uuid, chunk_index: u64) -> String {
        format!(
            "{}/chunks/{}/upload-url",
            self.recording_url(session_id),
            chunk_index
        )
    }

    pub fn complete_url(&self, session_id: Uuid) -> String {
        format!("{}/complete", self.recording_url(session_id))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check_status(response: Response) -> Result<Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            code: status.as_u16(),
            body,
        })
    }

    async fn upload_via_backend(
        &self,
        session_id: Uuid,
        payload: Bytes,
        chunk_index: u64,
    ) -> Result<Ack, TransportError> {
        let url = self.chunk_url(session_id, chunk_index);
        trace!("[{}] POST {} ({} bytes)", session_id, url, payload.len());
        let request = self
            .client
            .post(&url)
            .header("Content-Type", self.content_type.as_str())
            .header("X-Chunk-Index", chunk_index.to_string())
            .body(payload);
        let response = Self::check_status(self.authorized(request).send().await?).await?;

        // The body is informational; an empty or non-JSON body is still a success.
        let text = response.text().await.unwrap_or_default();
        let parsed: ChunkUploadResponse = serde_json::from_str(&text).unwrap_or_default();
        let location = parsed.file_path.or(parsed.chunk_id);
        Ok(Ack {
            chunk_index,
            location,
        })
    }

    async fn upload_via_signed_url(
        &self,
        session_id: Uuid,
        payload: Bytes,
        chunk_index: u64,
    ) -> Result<Ack, TransportError> {
        let endpoint = self.upload_url_endpoint(session_id, chunk_index);
        trace!("[{}] requesting signed URL from {}", session_id, endpoint);
        let request = self.client.post(&endpoint);
        let response = Self::check_status(self.authorized(request).send().await?).await?;
        let signed: UploadUrlResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        trace!(
            "[{}] PUT chunk {} to signed URL ({} bytes)",
            session_id,
            chunk_index,
            payload.len()
        );
        // Signed URLs carry their own credentials; no bearer token here.
        let response = self
            .client
            .put(&signed.upload_url)
            .header("Content-Type", self.content_type.as_str())
            .body(payload)
            .send()
            .await?;
        Self::check_status(response).await?;

        let location = signed
            .upload_url
            .split('?')
            .next()
            .unwrap_or(&signed.upload_url)
            .to_string();
        Ok(Ack::with_location(chunk_index, location))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(
        &self,
        session_id: Uuid,
        payload: Bytes,
        chunk_index: u64,
    ) -> Result<Ack, TransportError> {
        match self.strategy {
            HttpStrategy::BackendProxy => {
                self.upload_via_backend(session_id, payload, chunk_index)
                    .await
            }
            HttpStrategy::SignedUrl => {
                self.upload_via_signed_url(session_id, payload, chunk_index)
                    .await
            }
        }
    }

    async fn finalize(
        &self,
        session_id: Uuid,
        summary: &CompletionSummary,
    ) -> Result<(), TransportError> {
        let url = self.complete_url(session_id);
        debug!(
            "[{}] reporting completion: {} chunk(s), {} byte(s), {}s",
            session_id, summary.chunk_count, summary.total_file_size_bytes, summary.duration_seconds
        );
        let request = self.client.post(&url).json(summary);
        Self::check_status(self.authorized(request).send().await?).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        match self.strategy {
            HttpStrategy::BackendProxy => "backend-proxy",
            HttpStrategy::SignedUrl => "signed-url",
        }
    }
}
