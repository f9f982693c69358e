//! Throttled snapshotting and the start-up recovery query.
//!
//! `SessionPersistence` is the single writer of the durable record. Writes
//! through [`SessionPersistence::update_session`] are throttled to one per
//! `throttle_secs` unless the status changes or the chunk index advances;
//! every other write is immediate. Read failures and malformed records never surface as errors
//! from the recovery query: the record is treated as absent and purged.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::time::Instant;
use uuid::Uuid;

use crate::configuration::types::PersistenceConfig;
use crate::error_handling::types::PersistenceError;

use super::store::SessionStore;
use super::types::{
    CleanupReport, PersistedSession, PersistedStatus, PurgeReason, RecoveryInfo, SessionUpdate,
    SCHEMA_VERSION,
};

pub struct SessionPersistence {
    store: Arc<dyn SessionStore>,
    config: PersistenceConfig,
    last_write: Mutex<Option<WriteMark>>,
}

/// What the last successful write stored, and when.
#[derive(Debug, Clone, Copy)]
struct WriteMark {
    at: Instant,
    status: PersistedStatus,
    chunk_index: u64,
}

impl WriteMark {
    /// Changes that must reach the store regardless of the throttle.
    fn must_write(&self, update: &SessionUpdate) -> bool {
        update.status.is_some_and(|s| s != self.status)
            || update.chunk_index.is_some_and(|i| i > self.chunk_index)
    }
}

/// Outcome of reading and classifying the stored record.
enum Loaded {
    Empty,
    Usable(PersistedSession),
    Unusable(PurgeReason),
}

impl SessionPersistence {
    pub fn new(store: Arc<dyn SessionStore>, config: PersistenceConfig) -> Self {
        debug!("Session persistence backed by {}", store.describe());
        Self {
            store,
            config,
            last_write: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    fn last_write(&self) -> MutexGuard<'_, Option<WriteMark>> {
        self.last_write.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, record: &mut PersistedSession) -> Result<(), PersistenceError> {
        record.version = SCHEMA_VERSION;
        record.persisted_at = Utc::now();
        let raw = serde_json::to_string(record)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        self.store.store(&raw)?;
        *self.last_write() = Some(WriteMark {
            at: Instant::now(),
            status: record.status,
            chunk_index: record.chunk_index,
        });
        Ok(())
    }

    fn read(&self) -> Result<Loaded, PersistenceError> {
        let Some(raw) = self.store.load()? else {
            return Ok(Loaded::Empty);
        };
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("Session record is not valid JSON: {}", e);
                return Ok(Loaded::Unusable(PurgeReason::Malformed));
            }
        };
        let version = value.get("version").and_then(|v| v.as_u64());
        if version != Some(SCHEMA_VERSION as u64) {
            let found = version.unwrap_or(0) as u32;
            warn!(
                "Session record has schema version {}, expected {}",
                found, SCHEMA_VERSION
            );
            return Ok(Loaded::Unusable(PurgeReason::VersionMismatch { found }));
        }
        match serde_json::from_value::<PersistedSession>(value) {
            Ok(record) => Ok(Loaded::Usable(record)),
            Err(e) => {
                warn!("Session record does not match the schema: {}", e);
                Ok(Loaded::Unusable(PurgeReason::Malformed))
            }
        }
    }

    /// Current record if it parses, regardless of status or age.
    pub fn load(&self) -> Result<Option<PersistedSession>, PersistenceError> {
        match self.read()? {
            Loaded::Usable(record) => Ok(Some(record)),
            Loaded::Empty | Loaded::Unusable(_) => Ok(None),
        }
    }

    /// Overwrites the durable record with `record`.
    pub fn save_session(&self, record: &PersistedSession) -> Result<(), PersistenceError> {
        let mut record = record.clone();
        self.write(&mut record)?;
        info!(
            "[{}] session snapshot saved ({:?}, {}ms, next chunk {})",
            record.session_id, record.status, record.duration_ms, record.chunk_index
        );
        Ok(())
    }

    /// Merges `update` into the active record. Returns whether a write
    /// happened: nothing is written without an active (recording or paused)
    /// record, or inside the throttle window. A status change or an advanced
    /// chunk index is never throttled: a recovered session must not reuse
    /// an index that was already handed off.
    pub fn update_session(&self, update: &SessionUpdate) -> Result<bool, PersistenceError> {
        if let Some(mark) = *self.last_write() {
            if !mark.must_write(update) && mark.at.elapsed() < self.config.throttle() {
                return Ok(false);
            }
        }

        let Some(mut record) = self.load()? else {
            debug!("No session record to update");
            return Ok(false);
        };
        if !record.status.is_recoverable() {
            debug!(
                "[{}] not updating {:?} session record",
                record.session_id, record.status
            );
            return Ok(false);
        }

        update.apply(&mut record);
        self.write(&mut record)?;
        debug!(
            "[{}] session snapshot updated ({:?}, {}ms)",
            record.session_id, record.status, record.duration_ms
        );
        Ok(true)
    }

    pub fn mark_session_completed(&self, session_id: Uuid) -> Result<bool, PersistenceError> {
        self.finish_session(session_id, PersistedStatus::Completed, &SessionUpdate::default())
    }

    pub fn mark_session_failed(&self, session_id: Uuid) -> Result<bool, PersistenceError> {
        self.finish_session(session_id, PersistedStatus::Failed, &SessionUpdate::default())
    }

    /// Merges the final bookkeeping in `last` and moves the record of
    /// `session_id` to a terminal status in one unthrottled write. Returns
    /// false if the stored record belongs to another session.
    pub fn finish_session(
        &self,
        session_id: Uuid,
        status: PersistedStatus,
        last: &SessionUpdate,
    ) -> Result<bool, PersistenceError> {
        match self.load()? {
            Some(mut record) if record.session_id == session_id => {
                last.apply(&mut record);
                record.status = status;
                record.paused_at = None;
                self.write(&mut record)?;
                info!("[{}] session record marked {:?}", session_id, status);
                Ok(true)
            }
            Some(record) => {
                warn!(
                    "[{}] cannot mark {:?}: stored record belongs to {}",
                    session_id, status, record.session_id
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub fn clear_session(&self) -> Result<(), PersistenceError> {
        self.store.remove()?;
        *self.last_write() = None;
        info!("Session record cleared");
        Ok(())
    }

    pub fn check_recovery(&self) -> RecoveryInfo {
        self.check_recovery_at(Utc::now())
    }

    /// Classifies the stored record as of `now`. Stale, malformed and
    /// mismatched records are purged as a side effect.
    pub fn check_recovery_at(&self, now: DateTime<Utc>) -> RecoveryInfo {
        let record = match self.read() {
            Ok(Loaded::Usable(record)) => record,
            Ok(Loaded::Empty) => return RecoveryInfo::none(),
            Ok(Loaded::Unusable(reason)) => {
                self.purge(&reason);
                return RecoveryInfo::none();
            }
            Err(e) => {
                warn!("Recovery check could not read the session record: {}", e);
                return RecoveryInfo::none();
            }
        };

        if !record.status.is_recoverable() {
            debug!(
                "[{}] stored session is {:?}; nothing to recover",
                record.session_id, record.status
            );
            return RecoveryInfo::none();
        }

        let age = record.age(now);
        if age > self.config.staleness() {
            info!(
                "[{}] stored session is {} minutes old; discarding",
                record.session_id,
                age.num_minutes()
            );
            self.purge(&PurgeReason::Stale);
            return RecoveryInfo::none();
        }

        let should_auto_recover = age < self.config.auto_recover_window();
        info!(
            "[{}] recoverable session found ({:?}, {}s old, auto={})",
            record.session_id,
            record.status,
            age.num_seconds(),
            should_auto_recover
        );
        RecoveryInfo {
            has_recoverable_session: true,
            session_data: Some(record),
            should_auto_recover,
        }
    }

    pub fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Utc::now())
    }

    /// Removes a stored record that is stale, malformed, from another schema
    /// version, or already finished.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let reason = match self.read() {
            Ok(Loaded::Empty) => return CleanupReport::default(),
            Ok(Loaded::Unusable(reason)) => reason,
            Ok(Loaded::Usable(record)) => {
                if !record.status.is_recoverable() {
                    PurgeReason::Finished(record.status)
                } else if record.age(now) > self.config.staleness() {
                    PurgeReason::Stale
                } else {
                    return CleanupReport {
                        purged: None,
                        kept: true,
                    };
                }
            }
            Err(e) => {
                warn!("Cleanup could not read the session record: {}", e);
                return CleanupReport::default();
            }
        };
        if self.purge(&reason) {
            CleanupReport {
                purged: Some(reason),
                kept: false,
            }
        } else {
            CleanupReport::default()
        }
    }

    fn purge(&self, reason: &PurgeReason) -> bool {
        match self.store.remove() {
            Ok(()) => {
                info!("Purged session record ({:?})", reason);
                true
            }
            Err(e) => {
                warn!("Failed to purge session record ({:?}): {}", reason, e);
                false
            }
        }
    }
}
