//! Capture lifecycle state machine.
//!
//! `CaptureController` owns one capture session at a time and moves it
//! through `idle -> requesting-permission -> recording <-> paused ->
//! stopping -> idle`, with `error` reachable from any state. The capture
//! facility and the controller's own timers talk to it only through
//! [`CaptureEvent`] messages, which the owner feeds back with
//! [`CaptureController::process_next_event`] (or
//! [`CaptureController::run_until_stopped`]).
//!
//! Side effects
//! - Every chunk the facility emits is handed to the [`UploadQueue`] under
//!   the session's next chunk index.
//! - Status changes, chunk hand-offs, and duration drift past
//!   `persist_threshold_secs` write a snapshot through
//!   [`SessionPersistence`]. Snapshot failures are logged and ignored.
//! - The completion callback fires exactly once per session, after the
//!   final payload has been handed to the queue.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::configuration::types::CaptureConfig;
use crate::error_handling::types::{CaptureError, PermissionError, PermissionErrorKind};
use crate::session_persistence::persistence::SessionPersistence;
use crate::session_persistence::types::{PersistedSession, PersistedStatus, SessionUpdate};
use crate::upload_queue::{UploadProgress, UploadQueue};

use super::clock::DurationClock;
use super::host::CaptureHost;
use super::timers::TimerHandle;
use super::types::{
    CaptureEvent, CaptureSession, CaptureStatus, CaptureStream, CompletionCallback, ErrorCallback,
    EventSink,
};

/// Last snapshot written, used to decide when the next one is due.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SnapshotMark {
    status: CaptureStatus,
    duration: Duration,
    chunk_index: u64,
}

pub struct CaptureController {
    config: CaptureConfig,
    host: Arc<dyn CaptureHost>,
    queue: UploadQueue,
    persistence: Arc<SessionPersistence>,

    status: CaptureStatus,
    stream: Option<CaptureStream>,
    session: Option<CaptureSession>,
    clock: DurationClock,

    generation: u64,
    events_tx: mpsc::UnboundedSender<(u64, CaptureEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, CaptureEvent)>,
    tick_timer: Option<TimerHandle>,
    stop_watchdog: Option<TimerHandle>,

    last_snapshot: Option<SnapshotMark>,
    pending_restore: Option<PersistedSession>,
    /// Upload progress a recovered session had before this process.
    carried_progress: UploadProgress,
    completion_fired: bool,
    last_error: Option<CaptureError>,
    on_complete: Option<CompletionCallback>,
    on_error: Option<ErrorCallback>,
}

impl CaptureController {
    pub fn new(
        config: CaptureConfig,
        host: Arc<dyn CaptureHost>,
        queue: UploadQueue,
        persistence: Arc<SessionPersistence>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        debug!("Capture controller created on {}", host.name());
        Self {
            config,
            host,
            queue,
            persistence,
            status: CaptureStatus::Idle,
            stream: None,
            session: None,
            clock: DurationClock::default(),
            generation: 0,
            events_tx,
            events_rx,
            tick_timer: None,
            stop_watchdog: None,
            last_snapshot: None,
            pending_restore: None,
            carried_progress: UploadProgress::default(),
            completion_fired: false,
            last_error: None,
            on_complete: None,
            on_error: None,
        }
    }

    /// Registers the callback invoked once per session with its id after the
    /// final payload was handed to the upload queue.
    pub fn on_complete<F>(&mut self, callback: F)
    where
        F: FnMut(Uuid) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
    }

    /// Registers the callback invoked for every permission, capture, or
    /// chunk hand-off error.
    pub fn on_error<F>(&mut self, callback: F)
    where
        F: FnMut(&CaptureError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
    }

    pub fn status(&self) -> CaptureStatus {
        self.status
    }

    /// Current (or last) session with its live duration.
    pub fn session(&self) -> Option<CaptureSession> {
        self.session.as_ref().map(|s| {
            let mut session = s.clone();
            session.status = self.status;
            session.duration = self.clock.elapsed();
            session.upload_progress = self.progress_for(s.session_id);
            session
        })
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.session_id)
    }

    pub fn duration(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub fn last_error(&self) -> Option<&CaptureError> {
        self.last_error.as_ref()
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    /// Number of owned timers currently armed.
    pub fn active_timer_count(&self) -> usize {
        self.tick_timer.iter().count() + self.stop_watchdog.iter().count()
    }

    /// Asks the host for a capture grant.
    ///
    /// Success leaves the controller `idle` holding a live handle; calling
    /// again while a live handle is held is a no-op. Any refusal moves to
    /// `error` with a classified [`PermissionError`] and drops the handle.
    pub async fn request_permission(&mut self) -> Result<(), CaptureError> {
        if self.status.is_active() || self.status == CaptureStatus::Stopping {
            warn!(
                "Permission requested while {}; ignoring",
                self.status
            );
            return Ok(());
        }
        if self.stream.as_ref().is_some_and(|s| s.live_tracks() > 0) {
            debug!("Capture grant already held");
            self.status = CaptureStatus::Idle;
            return Ok(());
        }

        self.status = CaptureStatus::RequestingPermission;
        debug!("Requesting capture permission from {}", self.host.name());
        match self.host.request_capture().await {
            Ok(stream) => {
                info!(
                    "Capture permission granted: stream {} with {} track(s)",
                    stream.id,
                    stream.tracks.len()
                );
                self.stream = Some(stream);
                self.status = CaptureStatus::Idle;
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                self.stream = None;
                Err(self.fail(CaptureError::Permission(err)))
            }
        }
    }

    /// Starts a capture session and returns its id.
    ///
    /// Requests permission first if no live handle is held. A handle without
    /// a live track fails with the non-retryable `InvalidStream`. A session
    /// armed with [`restore`](Self::restore) continues under its recovered
    /// id, chunk numbering, and duration.
    pub async fn start_recording(&mut self) -> Result<Uuid, CaptureError> {
        if let Some(active) = self.active_session_id() {
            warn!("[{}] start requested while {}", active, self.status);
            return Err(CaptureError::AlreadyActive(active));
        }
        if self.stream.is_none() {
            self.request_permission().await?;
        }
        let Some(stream) = self.stream.clone() else {
            return Err(self.fail(CaptureError::Permission(PermissionError::new(
                PermissionErrorKind::NoSource,
                "no capture handle after permission request",
            ))));
        };
        if stream.live_tracks() == 0 {
            self.host.stop_tracks(&stream);
            self.stream = None;
            return Err(self.fail(CaptureError::InvalidStream(format!(
                "stream {} has no live track",
                stream.id
            ))));
        }

        let restored = self.pending_restore.take();
        let session = match &restored {
            Some(record) => {
                let mut metadata = record.metadata.clone();
                metadata.extend(stream.metadata.clone());
                CaptureSession {
                    session_id: record.session_id,
                    status: CaptureStatus::Recording,
                    duration: record.duration(),
                    chunk_index: record.chunk_index,
                    chunk_count: record.chunk_count,
                    upload_progress: record.upload_progress.clone(),
                    metadata,
                    started_at: record.started_at,
                    paused_at: None,
                }
            }
            None => CaptureSession {
                session_id: Uuid::new_v4(),
                status: CaptureStatus::Recording,
                duration: Duration::ZERO,
                chunk_index: 0,
                chunk_count: 0,
                upload_progress: Default::default(),
                metadata: stream.metadata.clone(),
                started_at: Utc::now(),
                paused_at: None,
            },
        };
        let session_id = session.session_id;

        self.generation += 1;
        let sink = self.sink();
        if let Err(err) = self
            .host
            .start_facility(&stream, self.config.timeslice(), sink.clone())
            .await
        {
            self.host.stop_tracks(&stream);
            self.stream = None;
            if let Some(record) = restored {
                self.pending_restore = Some(record);
            }
            return Err(self.fail(err));
        }

        self.clock.start_from(session.duration);
        self.carried_progress = restored
            .as_ref()
            .map(|record| record.upload_progress.clone())
            .unwrap_or_default();
        self.session = Some(session);
        self.status = CaptureStatus::Recording;
        self.completion_fired = false;
        self.last_error = None;
        self.last_snapshot = None;
        self.tick_timer = Some(TimerHandle::interval(
            "duration-tick",
            self.config.tick_interval(),
            sink,
            || CaptureEvent::Tick,
        ));

        match &restored {
            Some(record) => info!(
                "[{}] recording resumed at chunk {} after {}s",
                session_id,
                record.chunk_index,
                record.duration().as_secs()
            ),
            None => info!("[{}] recording started", session_id),
        }
        self.save_snapshot();
        Ok(session_id)
    }

    /// Freezes the duration clock. The capture facility keeps running.
    /// Returns false (with a warning) unless currently recording.
    pub async fn pause_recording(&mut self) -> bool {
        if self.status != CaptureStatus::Recording {
            warn!("Pause requested while {}; ignoring", self.status);
            return false;
        }
        self.clock.pause();
        if let Err(e) = self.host.pause_facility().await {
            warn!("{} ignored pause: {}", self.host.name(), e);
        }
        self.status = CaptureStatus::Paused;
        if let Some(session) = self.session.as_mut() {
            session.paused_at = Some(Utc::now());
            info!(
                "[{}] recording paused at {:.1}s",
                session.session_id,
                self.clock.elapsed().as_secs_f64()
            );
        }
        self.persist_snapshot();
        true
    }

    /// Restarts the duration clock. Returns false (with a warning) unless
    /// currently paused.
    pub async fn resume_recording(&mut self) -> bool {
        if self.status != CaptureStatus::Paused {
            warn!("Resume requested while {}; ignoring", self.status);
            return false;
        }
        self.clock.resume();
        if let Err(e) = self.host.resume_facility().await {
            warn!("{} ignored resume: {}", self.host.name(), e);
        }
        self.status = CaptureStatus::Recording;
        if let Some(session) = self.session.as_mut() {
            session.paused_at = None;
            info!("[{}] recording resumed", session.session_id);
        }
        self.persist_snapshot();
        true
    }

    /// Stops the session: fixes the duration, releases the tracks, and asks
    /// the facility to flush. The session completes when the facility
    /// reports `FacilityStopped`, or when the stop watchdog fires.
    ///
    /// Calling it again, or after the source ended, is a no-op. Returns
    /// whether this call began stopping.
    pub async fn stop_recording(&mut self) -> bool {
        match self.status {
            CaptureStatus::Recording | CaptureStatus::Paused => {}
            CaptureStatus::Stopping => {
                debug!("Stop already in progress");
                return false;
            }
            other => {
                warn!("Stop requested while {}; ignoring", other);
                return false;
            }
        }

        self.status = CaptureStatus::Stopping;
        let duration = self.halt_clock();
        let session_id = self.session_id().unwrap_or_default();
        info!(
            "[{}] stopping after {:.1}s",
            session_id,
            duration.as_secs_f64()
        );

        self.stop_watchdog = Some(TimerHandle::once(
            "stop-watchdog",
            self.config.stop_timeout(),
            self.sink(),
            CaptureEvent::StopTimeout,
        ));
        if let Err(e) = self.host.stop_facility().await {
            warn!("[{}] facility failed to stop cleanly: {}", session_id, e);
            self.release_stream();
            self.finalize();
            return true;
        }
        self.release_stream();
        true
    }

    /// Asks the facility for the data captured so far. No-op unless a
    /// session is in progress.
    pub async fn flush(&mut self) -> Result<(), CaptureError> {
        if !self.status.is_active() {
            warn!("Flush requested while {}; ignoring", self.status);
            return Ok(());
        }
        self.host.request_data().await
    }

    /// Arms the next `start_recording` to continue a recovered session.
    /// The capture grant itself is not restored. Chunks still pending in the
    /// previous process are not re-sent; their persisted progress is carried
    /// and added to what this process delivers.
    pub fn restore(&mut self, record: PersistedSession) -> Result<(), CaptureError> {
        if let Some(active) = self.active_session_id() {
            return Err(CaptureError::AlreadyActive(active));
        }
        info!(
            "[{}] recovered session armed: {}s captured, next chunk {}",
            record.session_id,
            record.duration().as_secs(),
            record.chunk_index
        );
        self.pending_restore = Some(record);
        Ok(())
    }

    /// Drops an armed recovery and clears the durable record.
    pub fn discard_recovery(&mut self) {
        if let Some(record) = self.pending_restore.take() {
            info!("[{}] recovered session discarded", record.session_id);
        }
        if let Err(e) = self.persistence.clear_session() {
            warn!("Failed to clear session record: {}", e);
        }
    }

    pub fn pending_restore(&self) -> Option<&PersistedSession> {
        self.pending_restore.as_ref()
    }

    /// Waits for the next event of the current capture. Cancel-safe.
    pub async fn next_event(&mut self) -> CaptureEvent {
        loop {
            // The controller holds a sender, so the channel never closes.
            let Some((generation, event)) = self.events_rx.recv().await else {
                return CaptureEvent::FacilityStopped;
            };
            if generation == self.generation {
                return event;
            }
            trace!("dropping {:?} from capture generation {}", event, generation);
        }
    }

    pub async fn process_next_event(&mut self) -> CaptureEvent {
        let event = self.next_event().await;
        self.handle_event(event.clone()).await;
        event
    }

    /// Handles every event already queued without waiting. Returns how
    /// many were handled.
    pub async fn process_pending_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok((generation, event)) = self.events_rx.try_recv() {
            if generation != self.generation {
                continue;
            }
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Drives events until the session has left recording, paused, and
    /// stopping.
    pub async fn run_until_stopped(&mut self) {
        while self.status.is_active() || self.status == CaptureStatus::Stopping {
            self.process_next_event().await;
        }
    }

    pub async fn handle_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Tick => {
                if self.status == CaptureStatus::Recording {
                    self.persist_snapshot();
                }
            }
            CaptureEvent::DataAvailable(payload) => self.accept_chunk(payload),
            CaptureEvent::SourceEnded => match self.status {
                CaptureStatus::Recording | CaptureStatus::Paused => {
                    info!(
                        "[{}] capture source ended outside the controller",
                        self.session_id().unwrap_or_default()
                    );
                    self.stop_recording().await;
                }
                other => debug!("source ended while {}; nothing to do", other),
            },
            CaptureEvent::FacilityStopped => match self.status {
                CaptureStatus::Stopping => self.finalize(),
                CaptureStatus::Recording | CaptureStatus::Paused => {
                    warn!(
                        "[{}] capture facility stopped on its own",
                        self.session_id().unwrap_or_default()
                    );
                    self.status = CaptureStatus::Stopping;
                    self.halt_clock();
                    self.release_stream();
                    self.finalize();
                }
                other => debug!("facility stopped while {}", other),
            },
            CaptureEvent::FacilityError(message) => {
                if self.status.is_active() || self.status == CaptureStatus::Stopping {
                    self.abort_capture(message);
                } else {
                    debug!("facility error while {}: {}", self.status, message);
                }
            }
            CaptureEvent::StopTimeout => {
                if self.status == CaptureStatus::Stopping {
                    warn!(
                        "[{}] facility did not flush within {:?}; finalizing",
                        self.session_id().unwrap_or_default(),
                        self.config.stop_timeout()
                    );
                    self.finalize();
                }
            }
        }
    }

    fn active_session_id(&self) -> Option<Uuid> {
        if self.status.is_active() || self.status == CaptureStatus::Stopping {
            self.session_id()
        } else {
            None
        }
    }

    fn progress_for(&self, session_id: Uuid) -> UploadProgress {
        self.queue
            .progress_for(session_id)
            .combined(&self.carried_progress)
    }

    fn sink(&self) -> EventSink {
        EventSink::new(self.generation, self.events_tx.clone())
    }

    fn accept_chunk(&mut self, payload: Bytes) {
        let Some(session) = self.session.as_mut() else {
            warn!("Dropping {} byte chunk: no capture session", payload.len());
            return;
        };
        if !(self.status.is_active() || self.status == CaptureStatus::Stopping) {
            warn!(
                "[{}] dropping {} byte chunk while {}",
                session.session_id,
                payload.len(),
                self.status
            );
            return;
        }
        if payload.is_empty() {
            trace!("[{}] skipping empty chunk", session.session_id);
            return;
        }

        let size = payload.len();
        match self
            .queue
            .add_chunk(session.session_id, session.chunk_index, payload)
        {
            Ok(job) => {
                debug!(
                    "[{}] chunk {} ({} bytes) handed off as {}",
                    session.session_id, session.chunk_index, size, job
                );
                session.chunk_index += 1;
                session.chunk_count += 1;
                self.persist_snapshot();
            }
            Err(e) => {
                error!(
                    "[{}] chunk {} rejected by upload queue: {}",
                    session.session_id, session.chunk_index, e
                );
                self.report(&CaptureError::Queue(e));
            }
        }
    }

    /// Stops the clock and cancels the tick timer. Returns the final duration.
    fn halt_clock(&mut self) -> Duration {
        self.tick_timer = None;
        let duration = self.clock.stop();
        if let Some(session) = self.session.as_mut() {
            session.duration = duration;
            session.paused_at = None;
        }
        duration
    }

    fn release_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.host.stop_tracks(&stream);
        }
    }

    /// Completes a stopping session.
    fn finalize(&mut self) {
        if self.status != CaptureStatus::Stopping {
            return;
        }
        self.stop_watchdog = None;
        self.tick_timer = None;
        self.status = CaptureStatus::Idle;

        let Some(session) = self.session.clone() else {
            return;
        };
        self.finish_record(&session, PersistedStatus::Completed);
        info!(
            "[{}] recording complete: {:.1}s, {} chunk(s)",
            session.session_id,
            session.duration.as_secs_f64(),
            session.chunk_count
        );
        self.fire_completion(session.session_id);
    }

    /// Mid-capture facility failure: no retry, chunks already captured are
    /// still forwarded.
    fn abort_capture(&mut self, message: String) {
        let session = self.session_id().unwrap_or_default();
        error!("[{}] capture facility failed: {}", session, message);
        self.stop_watchdog = None;
        self.halt_clock();
        self.release_stream();
        self.fail(CaptureError::Facility(message));

        let Some(session) = self.session.clone() else {
            return;
        };
        self.finish_record(&session, PersistedStatus::Failed);
        if session.chunk_count > 0 {
            self.fire_completion(session.session_id);
        }
    }

    /// Terminal snapshot carrying the fixed duration and chunk counters.
    fn finish_record(&self, session: &CaptureSession, status: PersistedStatus) {
        let last = SessionUpdate {
            duration_ms: Some(session.duration.as_millis() as u64),
            chunk_index: Some(session.chunk_index),
            chunk_count: Some(session.chunk_count),
            upload_progress: Some(self.progress_for(session.session_id)),
            ..Default::default()
        };
        if let Err(e) = self
            .persistence
            .finish_session(session.session_id, status, &last)
        {
            warn!(
                "[{}] failed to mark session {:?}: {}",
                session.session_id, status, e
            );
        }
    }

    fn fire_completion(&mut self, session_id: Uuid) {
        if self.completion_fired {
            return;
        }
        self.completion_fired = true;
        if let Some(callback) = self.on_complete.as_mut() {
            callback(session_id);
        }
    }

    /// Moves to `error`, cancels timers, and reports `err`.
    fn fail(&mut self, err: CaptureError) -> CaptureError {
        self.status = CaptureStatus::Error;
        self.tick_timer = None;
        self.stop_watchdog = None;
        if self.clock.is_running() {
            self.halt_clock();
        }
        warn!("Capture error: {}", err);
        self.report(&err);
        self.last_error = Some(err.clone());
        err
    }

    fn report(&mut self, err: &CaptureError) {
        if let Some(callback) = self.on_error.as_mut() {
            callback(err);
        }
    }

    fn build_record(&self) -> Option<PersistedSession> {
        let session = self.session.as_ref()?;
        let status = self.status.persisted()?;
        let mut record = PersistedSession::new(session.session_id, status);
        record.started_at = session.started_at;
        record.duration_ms = self.clock.elapsed().as_millis() as u64;
        record.chunk_index = session.chunk_index;
        record.chunk_count = session.chunk_count;
        record.upload_progress = self.progress_for(session.session_id);
        record.metadata = session.metadata.clone();
        record.paused_at = session.paused_at;
        Some(record)
    }

    fn mark(&self) -> Option<SnapshotMark> {
        let session = self.session.as_ref()?;
        Some(SnapshotMark {
            status: self.status,
            duration: self.clock.elapsed(),
            chunk_index: session.chunk_index,
        })
    }

    /// Full overwrite at session start.
    fn save_snapshot(&mut self) {
        let Some(record) = self.build_record() else {
            return;
        };
        match self.persistence.save_session(&record) {
            Ok(()) => self.last_snapshot = self.mark(),
            Err(e) => warn!("[{}] snapshot not saved: {}", record.session_id, e),
        }
    }

    /// Writes a snapshot if the status or chunk index changed, or the
    /// duration drifted past the threshold since the last one.
    fn persist_snapshot(&mut self) {
        let Some(mark) = self.mark() else {
            return;
        };
        if let Some(last) = self.last_snapshot {
            let drift = if mark.duration > last.duration {
                mark.duration - last.duration
            } else {
                last.duration - mark.duration
            };
            if last.status == mark.status
                && last.chunk_index == mark.chunk_index
                && drift < self.config.persist_threshold()
            {
                return;
            }
        }
        let Some(record) = self.build_record() else {
            return;
        };
        let update = SessionUpdate {
            status: Some(record.status),
            duration_ms: Some(record.duration_ms),
            chunk_index: Some(record.chunk_index),
            chunk_count: Some(record.chunk_count),
            upload_progress: Some(record.upload_progress),
            metadata: None,
            paused_at: Some(record.paused_at),
        };
        if self.persist_update(&update) {
            self.last_snapshot = Some(mark);
        }
    }

    fn persist_update(&self, update: &SessionUpdate) -> bool {
        match self.persistence.update_session(update) {
            Ok(written) => written,
            Err(e) => {
                warn!(
                    "[{}] snapshot not written: {}",
                    self.session_id().unwrap_or_default(),
                    e
                );
                false
            }
        }
    }
}
