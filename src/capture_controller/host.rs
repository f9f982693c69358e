use std::time::Duration;

use async_trait::async_trait;

use crate::error_handling::types::{CaptureError, PermissionError};

use super::types::{CaptureStream, EventSink};

/// Platform capture API as seen by the controller.
///
/// A host grants capture handles and runs the native capture facility. The
/// facility reports back only through the [`EventSink`] it was started
/// with: `DataAvailable` for each timeslice (and on `request_data`),
/// `SourceEnded` when the source goes away on its own, `FacilityError` on
/// failure, and `FacilityStopped` once it has flushed after `stop_facility`.
#[async_trait]
pub trait CaptureHost: Send + Sync {
    /// Asks for a capture grant.
    async fn request_capture(&self) -> Result<CaptureStream, PermissionError>;

    async fn start_facility(
        &self,
        stream: &CaptureStream,
        timeslice: Duration,
        sink: EventSink,
    ) -> Result<(), CaptureError>;

    /// Pause hint. The facility keeps its grant.
    async fn pause_facility(&self) -> Result<(), CaptureError> {
        Ok(())
    }

    async fn resume_facility(&self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Requests the data captured so far as a `DataAvailable` event.
    async fn request_data(&self) -> Result<(), CaptureError>;

    async fn stop_facility(&self) -> Result<(), CaptureError>;

    /// Releases every track of `stream`.
    fn stop_tracks(&self, stream: &CaptureStream);

    fn name(&self) -> &str {
        "capture host"
    }
}
