//! Bounded-concurrency chunk delivery with retry and backoff.
//!
//! `UploadQueue` accepts chunk jobs, keeps at most `concurrency` attempts in
//! flight through the configured [`Transport`], and retries failures with
//! exponential backoff until `max_retries` is exhausted.
//!
//! Scheduling
//! - Dispatch is FIFO by enqueue order among eligible jobs: queued ones and
//!   retry-waiting ones whose backoff has elapsed.
//! - Completion order is whatever the transport produces.
//! - Every attempt runs under `timeout_ms`; a timeout is an ordinary failure.
//!
//! All job bookkeeping happens under one lock; listeners are called after the
//! lock is released, with the events produced by that step.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::configuration::types::UploadConfig;
use crate::error_handling::types::{QueueError, TransportError};
use crate::transport::{Ack, Transport};

use super::backoff::{retry_delay, should_retry};
use super::listeners::{Listener, ListenerId, ListenerSet};
use super::types::{
    DeliveryOutcome, JobId, JobRef, JobState, QueueEvent, UploadJob, UploadProgress,
};

/// Handle to a shared upload queue. Clones refer to the same queue.
///
/// Must be used from within a tokio runtime: enqueueing spawns the upload
/// attempts.
#[derive(Clone)]
pub struct UploadQueue {
    shared: Arc<Shared>,
}

struct Shared {
    config: UploadConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<QueueState>,
    listeners: ListenerSet,
    /// Number of outstanding jobs, for `wait_idle`.
    outstanding: watch::Sender<usize>,
}

#[derive(Default)]
struct QueueState {
    jobs: BTreeMap<JobId, UploadJob>,
    in_flight: HashMap<JobId, AbortHandle>,
    retry_timers: HashMap<JobId, AbortHandle>,
    next_job_id: u64,
    failed_sessions: HashSet<Uuid>,
}

impl QueueState {
    fn progress(&self) -> UploadProgress {
        UploadProgress::from_jobs(self.jobs.values())
    }

    fn outstanding(&self) -> usize {
        self.jobs.values().filter(|j| j.state.is_outstanding()).count()
    }

    fn next_eligible(&self, now: Instant) -> Option<JobId> {
        self.jobs
            .values()
            .find(|job| job.is_eligible(now))
            .map(|job| job.id)
    }

    fn session_outcome(&self, session_id: Uuid) -> DeliveryOutcome {
        let mut total = 0u64;
        let mut failed = 0u64;
        for job in self.jobs.values().filter(|j| j.session_id == session_id) {
            total += 1;
            match job.state {
                s if s.is_outstanding() => return DeliveryOutcome::Pending,
                JobState::FailedTerminal => failed += 1,
                _ => {}
            }
        }
        match (total, failed) {
            (0, _) => DeliveryOutcome::Unknown,
            (_, 0) => DeliveryOutcome::Delivered,
            (t, f) if t == f => DeliveryOutcome::Failed,
            (_, f) => DeliveryOutcome::PartiallyFailed { failed: f },
        }
    }
}

impl UploadQueue {
    pub fn new(config: UploadConfig, transport: Arc<dyn Transport>) -> Self {
        info!(
            "Upload queue ready: transport={}, concurrency={}, max_retries={}, timeout={}ms",
            transport.name(),
            config.concurrency,
            config.max_retries,
            config.timeout_ms
        );
        let (outstanding, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                state: Mutex::new(QueueState::default()),
                listeners: ListenerSet::default(),
                outstanding,
            }),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.shared.config
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.shared.transport)
    }

    /// Enqueues one chunk and returns immediately.
    ///
    /// A chunk is delivered at most once: enqueueing a `(session, index)`
    /// pair that is already tracked returns the existing job, except that a
    /// terminally failed job is re-queued with the new payload.
    pub fn add_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u64,
        payload: impl Into<Bytes>,
    ) -> Result<JobId, QueueError> {
        let payload = payload.into();
        let size = payload.len() as u64;
        if size == 0 {
            return Err(QueueError::EmptyPayload);
        }
        if size > self.shared.config.max_chunk_bytes {
            return Err(QueueError::PayloadTooLarge {
                size,
                max: self.shared.config.max_chunk_bytes,
            });
        }

        let mut events = Vec::new();
        let id = {
            let mut st = self.shared.lock();
            let existing = st
                .jobs
                .values()
                .find(|j| j.session_id == session_id && j.chunk_index == chunk_index)
                .map(|j| (j.id, j.state));
            match existing {
                Some((id, JobState::FailedTerminal)) => {
                    debug!(
                        "[{}] chunk {} re-enqueued after terminal failure",
                        session_id, chunk_index
                    );
                    st.failed_sessions.remove(&session_id);
                    if let Some(job) = st.jobs.get_mut(&id) {
                        job.payload = payload;
                        job.size = size;
                        Self::reset_for_retry(job);
                        events.push(QueueEvent::Queued(job.job_ref()));
                    }
                    id
                }
                Some((id, state)) => {
                    debug!(
                        "[{}] chunk {} already tracked as {} ({:?})",
                        session_id, chunk_index, id, state
                    );
                    id
                }
                None => {
                    let id = JobId(st.next_job_id);
                    st.next_job_id += 1;
                    let job = UploadJob::new(id, session_id, chunk_index, payload);
                    trace!(
                        "[{}] chunk {} queued as {} ({} bytes)",
                        session_id,
                        chunk_index,
                        id,
                        size
                    );
                    events.push(QueueEvent::Queued(job.job_ref()));
                    st.jobs.insert(id, job);
                    id
                }
            }
        };

        self.shared.publish(events);
        Shared::pump(&self.shared);
        Ok(id)
    }

    /// Cancels every queued, in-flight, or retry-waiting job and drops it
    /// from the queue. In-flight transport calls are aborted best-effort.
    /// Returns the number of cancelled jobs.
    pub fn cancel_all(&self) -> usize {
        let events: Vec<QueueEvent> = {
            let mut st = self.shared.lock();
            for (_, handle) in st.in_flight.drain() {
                handle.abort();
            }
            for (_, handle) in st.retry_timers.drain() {
                handle.abort();
            }
            let cancelled: Vec<JobId> = st
                .jobs
                .values()
                .filter(|j| j.state.is_outstanding())
                .map(|j| j.id)
                .collect();
            cancelled
                .into_iter()
                .filter_map(|id| st.jobs.remove(&id))
                .map(|mut job| {
                    job.state = JobState::Cancelled;
                    QueueEvent::Cancelled(job.job_ref())
                })
                .collect()
        };

        let count = events.len();
        if count > 0 {
            warn!("Cancelled {} upload job(s)", count);
        }
        self.shared.publish(events);
        count
    }

    /// Re-queues every terminally failed job with its attempt count reset.
    /// Returns the number of re-queued jobs.
    pub fn retry_failed(&self) -> usize {
        let events: Vec<QueueEvent> = {
            let mut st = self.shared.lock();
            let mut events = Vec::new();
            let mut sessions = Vec::new();
            for job in st
                .jobs
                .values_mut()
                .filter(|j| j.state == JobState::FailedTerminal)
            {
                Self::reset_for_retry(job);
                sessions.push(job.session_id);
                events.push(QueueEvent::Queued(job.job_ref()));
            }
            for session_id in sessions {
                st.failed_sessions.remove(&session_id);
            }
            events
        };

        let count = events.len();
        if count > 0 {
            info!("Retrying {} failed upload job(s)", count);
        }
        self.shared.publish(events);
        Shared::pump(&self.shared);
        count
    }

    fn reset_for_retry(job: &mut UploadJob) {
        job.attempt = 0;
        job.state = JobState::Queued;
        job.retry_at = None;
        job.last_error = None;
    }

    /// Snapshot of aggregate progress over every tracked job.
    pub fn progress(&self) -> UploadProgress {
        self.shared.lock().progress()
    }

    /// Progress restricted to one session's chunks.
    pub fn progress_for(&self, session_id: Uuid) -> UploadProgress {
        let st = self.shared.lock();
        UploadProgress::from_jobs(st.jobs.values().filter(|j| j.session_id == session_id))
    }

    pub fn session_outcome(&self, session_id: Uuid) -> DeliveryOutcome {
        self.shared.lock().session_outcome(session_id)
    }

    pub fn job(&self, id: JobId) -> Option<UploadJob> {
        self.shared.lock().jobs.get(&id).cloned()
    }

    /// All tracked jobs in enqueue order.
    pub fn jobs(&self) -> Vec<UploadJob> {
        self.shared.lock().jobs.values().cloned().collect()
    }

    pub fn count_in_state(&self, state: JobState) -> usize {
        self.shared
            .lock()
            .jobs
            .values()
            .filter(|j| j.state == state)
            .count()
    }

    pub fn in_flight_count(&self) -> usize {
        self.count_in_state(JobState::InFlight)
    }

    pub fn is_idle(&self) -> bool {
        self.shared.lock().outstanding() == 0
    }

    /// Resolves once no job is queued, in flight, or waiting for a retry.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent, &UploadProgress) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.shared.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refreshes the idle watch and notifies listeners.
    fn publish(&self, events: Vec<QueueEvent>) {
        if events.is_empty() {
            return;
        }
        let (progress, outstanding) = {
            let st = self.lock();
            (st.progress(), st.outstanding())
        };
        self.outstanding.send_replace(outstanding);
        for event in &events {
            self.listeners.emit(event, &progress);
        }
    }

    /// Dispatches eligible jobs while worker slots are free.
    fn pump(shared: &Arc<Shared>) {
        let mut events = Vec::new();
        {
            let mut st = shared.lock();
            let now = Instant::now();
            while st.in_flight.len() < shared.config.concurrency {
                let Some(id) = st.next_eligible(now) else {
                    break;
                };
                let Some(job) = st.jobs.get_mut(&id) else {
                    break;
                };
                job.state = JobState::InFlight;
                job.retry_at = None;
                let job_ref = job.job_ref();
                let attempt = job.attempt;
                let payload = job.payload.clone();
                debug!(
                    "[{}] dispatching chunk {} (attempt {})",
                    job_ref.session_id, job_ref.chunk_index, attempt
                );
                events.push(QueueEvent::Dispatched {
                    job: job_ref,
                    attempt,
                });

                let task = tokio::spawn(Self::run_attempt(
                    Arc::clone(shared),
                    job_ref,
                    payload,
                    attempt,
                ));
                st.in_flight.insert(id, task.abort_handle());
            }
        }
        shared.publish(events);
    }

    async fn run_attempt(shared: Arc<Shared>, job: JobRef, payload: Bytes, attempt: u32) {
        let timeout = shared.config.timeout();
        let call = shared
            .transport
            .upload(job.session_id, payload, job.chunk_index);
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(shared.config.timeout_ms)),
        };
        Self::finish_attempt(&shared, job, attempt, outcome);
        Self::pump(&shared);
    }

    fn finish_attempt(
        shared: &Arc<Shared>,
        job_ref: JobRef,
        attempt: u32,
        outcome: Result<Ack, TransportError>,
    ) {
        let mut events = Vec::new();
        {
            let mut st = shared.lock();
            st.in_flight.remove(&job_ref.job_id);

            // Cancelled while the call was running.
            let Some(job) = st.jobs.get_mut(&job_ref.job_id) else {
                trace!(
                    "[{}] dropping result for cancelled chunk {}",
                    job_ref.session_id,
                    job_ref.chunk_index
                );
                return;
            };
            if job.state != JobState::InFlight || job.attempt != attempt {
                return;
            }

            match outcome {
                Ok(ack) => {
                    job.state = JobState::Succeeded;
                    job.last_error = None;
                    job.payload = Bytes::new();
                    debug!(
                        "[{}] chunk {} delivered on attempt {}",
                        job_ref.session_id, job_ref.chunk_index, attempt
                    );
                    events.push(QueueEvent::Succeeded {
                        job: job_ref,
                        attempt,
                        location: ack.location,
                    });
                }
                Err(err) if should_retry(&shared.config, attempt) => {
                    let delay = retry_delay(&shared.config, attempt);
                    job.state = JobState::FailedRetryable;
                    job.attempt = attempt + 1;
                    job.retry_at = Some(Instant::now() + delay);
                    job.last_error = Some(err.to_string());
                    warn!(
                        "[{}] chunk {} attempt {} failed, retrying in {}ms: {}",
                        job_ref.session_id,
                        job_ref.chunk_index,
                        attempt,
                        delay.as_millis(),
                        err
                    );
                    events.push(QueueEvent::FailedRetryable {
                        job: job_ref,
                        attempt,
                        retry_in_ms: delay.as_millis() as u64,
                        error: err.to_string(),
                    });

                    let timer_shared = Arc::clone(shared);
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        timer_shared.lock().retry_timers.remove(&job_ref.job_id);
                        Self::pump(&timer_shared);
                    });
                    st.retry_timers.insert(job_ref.job_id, timer.abort_handle());
                }
                Err(err) => {
                    job.state = JobState::FailedTerminal;
                    job.last_error = Some(err.to_string());
                    warn!(
                        "[{}] chunk {} failed terminally after {} attempt(s): {}",
                        job_ref.session_id,
                        job_ref.chunk_index,
                        attempt + 1,
                        err
                    );
                    events.push(QueueEvent::FailedTerminal {
                        job: job_ref,
                        attempt,
                        error: err.to_string(),
                    });

                    let session_failed = shared.config.fail_session_on_any_terminal
                        || st.session_outcome(job_ref.session_id) == DeliveryOutcome::Failed;
                    if session_failed && st.failed_sessions.insert(job_ref.session_id) {
                        warn!("[{}] session delivery failed", job_ref.session_id);
                        events.push(QueueEvent::SessionDeliveryFailed {
                            session_id: job_ref.session_id,
                        });
                    }
                }
            }
        }
        shared.publish(events);
    }
}
