//! Common data types used across the upload_queue subsystem.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Identifier of one chunk-delivery lineage. Ids grow with enqueue order,
/// which is what dispatch fairness is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Queued,
    InFlight,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
    Cancelled,
}

impl JobState {
    /// Queued, in flight, or waiting for a retry.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            JobState::Queued | JobState::InFlight | JobState::FailedRetryable
        )
    }
}

/// One chunk and its delivery attempts.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: JobId,
    pub session_id: Uuid,
    pub chunk_index: u64,
    /// Released once the chunk is delivered.
    pub payload: Bytes,
    /// Payload size, kept after the payload is released.
    pub size: u64,
    /// 0-based index of the current (or next) attempt.
    pub attempt: u32,
    pub state: JobState,
    /// Earliest dispatch time while `FailedRetryable`.
    pub retry_at: Option<Instant>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl UploadJob {
    pub(crate) fn new(id: JobId, session_id: Uuid, chunk_index: u64, payload: Bytes) -> Self {
        Self {
            id,
            session_id,
            chunk_index,
            size: payload.len() as u64,
            payload,
            attempt: 0,
            state: JobState::Queued,
            retry_at: None,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Whether a free worker may pick this job up at `now`.
    pub fn is_eligible(&self, now: Instant) -> bool {
        match self.state {
            JobState::Queued => true,
            JobState::FailedRetryable => self.retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef {
            job_id: self.id,
            session_id: self.session_id,
            chunk_index: self.chunk_index,
        }
    }
}

/// Identity of a job as carried on events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRef {
    pub job_id: JobId,
    pub session_id: Uuid,
    pub chunk_index: u64,
}

/// Aggregate delivery progress, derived from job states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub failed_chunks: u64,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
}

impl UploadProgress {
    pub(crate) fn from_jobs<'a>(jobs: impl Iterator<Item = &'a UploadJob>) -> Self {
        let mut progress = UploadProgress::default();
        for job in jobs {
            progress.total_chunks += 1;
            progress.total_bytes += job.size;
            match job.state {
                JobState::Succeeded => {
                    progress.completed_chunks += 1;
                    progress.uploaded_bytes += job.size;
                }
                JobState::FailedTerminal => progress.failed_chunks += 1,
                _ => {}
            }
        }
        if progress.total_chunks > 0 {
            progress.percentage =
                progress.completed_chunks as f64 * 100.0 / progress.total_chunks as f64;
        }
        progress
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.completed_chunks == self.total_chunks
    }

    /// Sum of two progress figures, e.g. a recovered session's persisted
    /// progress plus what this process has queued since.
    pub fn combined(&self, other: &UploadProgress) -> UploadProgress {
        let mut progress = UploadProgress {
            total_chunks: self.total_chunks + other.total_chunks,
            completed_chunks: self.completed_chunks + other.completed_chunks,
            failed_chunks: self.failed_chunks + other.failed_chunks,
            uploaded_bytes: self.uploaded_bytes + other.uploaded_bytes,
            total_bytes: self.total_bytes + other.total_bytes,
            percentage: 0.0,
        };
        if progress.total_chunks > 0 {
            progress.percentage =
                progress.completed_chunks as f64 * 100.0 / progress.total_chunks as f64;
        }
        progress
    }
}

/// A job state transition, broadcast to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Queued(JobRef),
    Dispatched { job: JobRef, attempt: u32 },
    Succeeded { job: JobRef, attempt: u32, location: Option<String> },
    FailedRetryable { job: JobRef, attempt: u32, retry_in_ms: u64, error: String },
    FailedTerminal { job: JobRef, attempt: u32, error: String },
    Cancelled(JobRef),
    /// Every chunk of the session enqueued so far failed terminally (or,
    /// with `fail_session_on_any_terminal`, the first one did). Sent once
    /// per session until `retry_failed` or a re-enqueue clears it; chunks
    /// added later and delivered do not retract it, so a live capture should
    /// consult `session_outcome` once its last chunk is queued.
    SessionDeliveryFailed { session_id: Uuid },
}

impl QueueEvent {
    pub fn job(&self) -> Option<&JobRef> {
        match self {
            QueueEvent::Queued(job) | QueueEvent::Cancelled(job) => Some(job),
            QueueEvent::Dispatched { job, .. }
            | QueueEvent::Succeeded { job, .. }
            | QueueEvent::FailedRetryable { job, .. }
            | QueueEvent::FailedTerminal { job, .. } => Some(job),
            QueueEvent::SessionDeliveryFailed { .. } => None,
        }
    }
}

/// Delivery state of every chunk belonging to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Some chunk is still queued, in flight, or waiting for a retry.
    Pending,
    Delivered,
    PartiallyFailed { failed: u64 },
    Failed,
    /// The queue holds no chunk for this session.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u64, size: usize, state: JobState) -> UploadJob {
        let mut job = UploadJob::new(JobId(id), Uuid::nil(), id, Bytes::from(vec![0u8; size]));
        job.state = state;
        job
    }

    #[test]
    fn progress_counts_terminal_states() {
        let jobs = vec![
            job(0, 10, JobState::Succeeded),
            job(1, 20, JobState::FailedTerminal),
            job(2, 30, JobState::InFlight),
            job(3, 40, JobState::Succeeded),
        ];
        let progress = UploadProgress::from_jobs(jobs.iter());
        assert_eq!(progress.total_chunks, 4);
        assert_eq!(progress.completed_chunks, 2);
        assert_eq!(progress.failed_chunks, 1);
        assert_eq!(progress.uploaded_bytes, 50);
        assert_eq!(progress.total_bytes, 100);
        assert_eq!(progress.percentage, 50.0);
        assert!(!progress.is_complete());
    }

    #[test]
    fn empty_progress_is_zero() {
        let progress = UploadProgress::from_jobs(std::iter::empty());
        assert_eq!(progress, UploadProgress::default());
        assert!(!progress.is_complete());
    }

    #[test]
    fn combined_progress_adds_counts_and_recomputes_percentage() {
        let earlier = UploadProgress::from_jobs(
            [job(0, 10, JobState::Succeeded), job(1, 10, JobState::Succeeded)].iter(),
        );
        let later = UploadProgress::from_jobs(
            [job(2, 5, JobState::Succeeded), job(3, 5, JobState::FailedTerminal)].iter(),
        );
        let total = earlier.combined(&later);
        assert_eq!(total.total_chunks, 4);
        assert_eq!(total.completed_chunks, 3);
        assert_eq!(total.failed_chunks, 1);
        assert_eq!(total.uploaded_bytes, 25);
        assert_eq!(total.total_bytes, 30);
        assert_eq!(total.percentage, 75.0);
        assert_eq!(earlier.combined(&UploadProgress::default()), earlier);
    }

    #[test]
    fn retryable_job_waits_for_its_time() {
        let now = Instant::now();
        let mut waiting = job(0, 1, JobState::FailedRetryable);
        waiting.retry_at = Some(now + std::time::Duration::from_millis(500));
        assert!(!waiting.is_eligible(now));
        assert!(waiting.is_eligible(now + std::time::Duration::from_millis(500)));
        assert!(!job(1, 1, JobState::InFlight).is_eligible(now));
    }
}
