use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::upload_queue::types::UploadProgress;

/// Version of the persisted record layout. Records with another version are
/// purged instead of migrated.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistedStatus {
    Recording,
    Paused,
    Completed,
    Failed,
}

impl PersistedStatus {
    /// Only sessions that were still capturing can be recovered.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PersistedStatus::Recording | PersistedStatus::Paused)
    }
}

/// Durable projection of a capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub version: u32,
    pub session_id: Uuid,
    pub status: PersistedStatus,
    pub started_at: DateTime<Utc>,
    /// Accumulated active capture time.
    pub duration_ms: u64,
    /// Index the next chunk will get.
    pub chunk_index: u64,
    pub chunk_count: u64,
    #[serde(default)]
    pub upload_progress: UploadProgress,
    /// Capture-environment facts, passed through untouched.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub persisted_at: DateTime<Utc>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
}

impl PersistedSession {
    pub fn new(session_id: Uuid, status: PersistedStatus) -> Self {
        let now = Utc::now();
        Self {
            version: SCHEMA_VERSION,
            session_id,
            status,
            started_at: now,
            duration_ms: 0,
            chunk_index: 0,
            chunk_count: 0,
            upload_progress: UploadProgress::default(),
            metadata: BTreeMap::new(),
            persisted_at: now,
            paused_at: None,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Time since the last snapshot. Clock skew into the future counts as zero.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.persisted_at).max(chrono::Duration::zero())
    }
}

/// Partial update merged into the current record. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub status: Option<PersistedStatus>,
    pub duration_ms: Option<u64>,
    pub chunk_index: Option<u64>,
    pub chunk_count: Option<u64>,
    pub upload_progress: Option<UploadProgress>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    /// `Some(None)` clears the pause timestamp.
    pub paused_at: Option<Option<DateTime<Utc>>>,
}

impl SessionUpdate {
    pub fn status(status: PersistedStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, record: &mut PersistedSession) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(duration_ms) = self.duration_ms {
            record.duration_ms = duration_ms;
        }
        if let Some(chunk_index) = self.chunk_index {
            record.chunk_index = chunk_index;
        }
        if let Some(chunk_count) = self.chunk_count {
            record.chunk_count = chunk_count;
        }
        if let Some(progress) = &self.upload_progress {
            record.upload_progress = progress.clone();
        }
        if let Some(metadata) = &self.metadata {
            record.metadata.extend(metadata.clone());
        }
        if let Some(paused_at) = self.paused_at {
            record.paused_at = paused_at;
        }
    }
}

/// Result of the start-up recovery query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryInfo {
    pub has_recoverable_session: bool,
    pub session_data: Option<PersistedSession>,
    pub should_auto_recover: bool,
}

impl RecoveryInfo {
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PurgeReason {
    Stale,
    Malformed,
    VersionMismatch { found: u32 },
    Finished(PersistedStatus),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Why the record was removed, if it was.
    pub purged: Option<PurgeReason>,
    /// A recoverable record is still present.
    pub kept: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_merges_only_given_fields() {
        let mut record = PersistedSession::new(Uuid::new_v4(), PersistedStatus::Recording);
        record.chunk_index = 4;
        record
            .metadata
            .insert("display".into(), serde_json::json!("1920x1080"));

        let mut metadata = BTreeMap::new();
        metadata.insert("client".into(), serde_json::json!("0.0.2"));
        SessionUpdate {
            duration_ms: Some(12_000),
            metadata: Some(metadata),
            paused_at: Some(Some(Utc::now())),
            ..Default::default()
        }
        .apply(&mut record);

        assert_eq!(record.status, PersistedStatus::Recording);
        assert_eq!(record.duration_ms, 12_000);
        assert_eq!(record.chunk_index, 4);
        assert_eq!(record.metadata.len(), 2);
        assert!(record.paused_at.is_some());

        SessionUpdate {
            paused_at: Some(None),
            ..Default::default()
        }
        .apply(&mut record);
        assert!(record.paused_at.is_none());
    }

    #[test]
    fn record_json_uses_lowercase_status() {
        let record = PersistedSession::new(Uuid::nil(), PersistedStatus::Paused);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "paused");
        assert_eq!(json["version"], SCHEMA_VERSION);
        let back: PersistedSession = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn future_timestamps_have_zero_age() {
        let mut record = PersistedSession::new(Uuid::nil(), PersistedStatus::Recording);
        let now = Utc::now();
        record.persisted_at = now + chrono::Duration::seconds(30);
        assert_eq!(record.age(now), chrono::Duration::zero());
    }
}
