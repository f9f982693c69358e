use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info};
use uuid::Uuid;

use crate::error_handling::types::TransportError;

use super::adapter::{Ack, CompletionSummary, Transport};

/// Delivers chunks into a local directory, one sub-directory per session.
///
/// Files are written under a temporary name and renamed into place, so a
/// retried attempt never leaves a half-written chunk behind.
pub struct FileTransport {
    base_path: PathBuf,
    extension: String,
}

impl FileTransport {
    pub fn new<P: AsRef<Path>>(base_path: P, extension: &str) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.base_path.join(session_id.to_string())
    }

    pub fn chunk_path(&self, session_id: Uuid, chunk_index: u64) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("chunk-{:05}.{}", chunk_index, self.extension))
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn upload(
        &self,
        session_id: Uuid,
        payload: Bytes,
        chunk_index: u64,
    ) -> Result<Ack, TransportError> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            error!("Failed to create chunk dir {}: {}", dir.display(), e);
            TransportError::Io(e)
        })?;

        let path = self.chunk_path(session_id, chunk_index);
        let tmp_path = path.with_extension("part");
        tokio::fs::write(&tmp_path, &payload).await.map_err(|e| {
            error!("Write failed {}: {}", tmp_path.display(), e);
            TransportError::Io(e)
        })?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(|e| {
            error!("Rename failed {}: {}", path.display(), e);
            TransportError::Io(e)
        })?;

        debug!(
            "[{}] wrote chunk {} ({} bytes) to {}",
            session_id,
            chunk_index,
            payload.len(),
            path.display()
        );
        Ok(Ack::with_location(chunk_index, path.display().to_string()))
    }

    async fn finalize(
        &self,
        session_id: Uuid,
        summary: &CompletionSummary,
    ) -> Result<(), TransportError> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::to_vec_pretty(summary)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        tokio::fs::write(dir.join("complete.json"), body).await?;
        info!("[{}] completion summary written to {}", session_id, dir.display());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn chunks_land_in_session_directory() {
        let dir = TempDir::new().unwrap();
        let transport = FileTransport::new(dir.path(), ".webm");
        let id = Uuid::new_v4();

        let ack = transport
            .upload(id, Bytes::from_static(b"first"), 0)
            .await
            .unwrap();
        transport
            .upload(id, Bytes::from_static(b"second"), 1)
            .await
            .unwrap();

        let first = transport.chunk_path(id, 0);
        assert_eq!(ack.location, Some(first.display().to_string()));
        assert!(first.ends_with(format!("{}/chunk-00000.webm", id)));
        assert_eq!(std::fs::read(first).unwrap(), b"first");
        assert_eq!(std::fs::read(transport.chunk_path(id, 1)).unwrap(), b"second");
    }

    #[tokio::test]
    async fn retried_chunk_overwrites_previous_attempt() {
        let dir = TempDir::new().unwrap();
        let transport = FileTransport::new(dir.path(), "mp4");
        let id = Uuid::new_v4();

        transport.upload(id, Bytes::from_static(b"partial"), 3).await.unwrap();
        transport.upload(id, Bytes::from_static(b"complete"), 3).await.unwrap();
        assert_eq!(std::fs::read(transport.chunk_path(id, 3)).unwrap(), b"complete");
    }

    #[tokio::test]
    async fn finalize_writes_summary() {
        let dir = TempDir::new().unwrap();
        let transport = FileTransport::new(dir.path(), "webm");
        let id = Uuid::new_v4();
        let summary = CompletionSummary {
            duration_seconds: 42,
            total_file_size_bytes: 10,
            chunk_count: 2,
        };
        transport.finalize(id, &summary).await.unwrap();

        let raw = std::fs::read(dir.path().join(id.to_string()).join("complete.json")).unwrap();
        let parsed: CompletionSummary = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed, summary);
    }
}
