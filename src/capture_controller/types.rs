//! Common data types used across the capture_controller subsystem.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error_handling::types::CaptureError;
use crate::session_persistence::types::PersistedStatus;
use crate::upload_queue::types::UploadProgress;

/// Lifecycle state of the capture controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureStatus {
    Idle,
    RequestingPermission,
    Recording,
    Paused,
    Stopping,
    Error,
}

impl CaptureStatus {
    /// Recording or paused: a capture session is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, CaptureStatus::Recording | CaptureStatus::Paused)
    }

    /// Status written to the durable record, if this state is persisted.
    pub fn persisted(&self) -> Option<PersistedStatus> {
        match self {
            CaptureStatus::Recording | CaptureStatus::Stopping => Some(PersistedStatus::Recording),
            CaptureStatus::Paused => Some(PersistedStatus::Paused),
            _ => None,
        }
    }
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaptureStatus::Idle => "idle",
            CaptureStatus::RequestingPermission => "requesting-permission",
            CaptureStatus::Recording => "recording",
            CaptureStatus::Paused => "paused",
            CaptureStatus::Stopping => "stopping",
            CaptureStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
    /// False once the track has ended or been stopped.
    pub live: bool,
}

impl TrackInfo {
    pub fn video(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Video,
            label: label.into(),
            live: true,
        }
    }
}

/// A granted capture handle.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStream {
    pub id: String,
    pub tracks: Vec<TrackInfo>,
    /// Device and display facts recorded with the session.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CaptureStream {
    pub fn new(id: impl Into<String>, tracks: Vec<TrackInfo>) -> Self {
        Self {
            id: id.into(),
            tracks,
            metadata: BTreeMap::new(),
        }
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.live).count()
    }
}

/// Discrete messages from the capture facility and the controller's own
/// timers into the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Duration clock tick.
    Tick,
    /// The capture source ended outside the controller, e.g. sharing was
    /// revoked from a host-level control.
    SourceEnded,
    /// Captured media ready to be delivered as one chunk.
    DataAvailable(Bytes),
    /// The facility has flushed its last payload after a stop request.
    FacilityStopped,
    FacilityError(String),
    /// The facility did not report `FacilityStopped` in time.
    StopTimeout,
}

/// Sending half handed to the capture facility and the controller's timers.
///
/// Every sink is stamped with the generation of the capture it belongs to,
/// so late events from a previous capture are discarded.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, CaptureEvent)>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, CaptureEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false if the controller is gone.
    pub fn send(&self, event: CaptureEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// In-memory view of the current (or last) capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSession {
    pub session_id: Uuid,
    pub status: CaptureStatus,
    /// Accumulated active capture time.
    pub duration: Duration,
    /// Index the next chunk will get.
    pub chunk_index: u64,
    /// Chunks handed to the upload queue.
    pub chunk_count: u64,
    pub upload_progress: UploadProgress,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
}

pub type CompletionCallback = Box<dyn FnMut(Uuid) + Send>;
pub type ErrorCallback = Box<dyn FnMut(&CaptureError) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopping_is_persisted_as_recording() {
        assert_eq!(
            CaptureStatus::Stopping.persisted(),
            Some(PersistedStatus::Recording)
        );
        assert_eq!(CaptureStatus::Error.persisted(), None);
        assert!(!CaptureStatus::Stopping.is_active());
    }

    #[test]
    fn sink_stamps_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert!(sink.send(CaptureEvent::Tick));
        assert_eq!(rx.try_recv().unwrap(), (7, CaptureEvent::Tick));
        drop(rx);
        assert!(!sink.send(CaptureEvent::Tick));
    }
}
