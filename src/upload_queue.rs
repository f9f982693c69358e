//! Upload queue
//!
//! Bounded-concurrency delivery of capture chunks with exponential-backoff
//! retries and a progress/event stream.
//!
//! Components:
//! - `queue`: the `UploadQueue` scheduler.
//! - `types`: jobs, job states, progress, and events.
//! - `backoff`: retry delay policy.
//! - `listeners`: the observer list progress UIs subscribe to.

pub mod backoff;
pub mod listeners;
pub mod queue;
#[cfg(test)]
pub mod tests;
pub mod types;

pub use listeners::ListenerId;
pub use queue::UploadQueue;
pub use types::{DeliveryOutcome, JobId, JobRef, JobState, QueueEvent, UploadJob, UploadProgress};
