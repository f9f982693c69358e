//! Session persistence
//!
//! Crash-recoverable snapshots of the active capture session. One JSON
//! record per client profile is kept in a [`SessionStore`]; a new session
//! overwrites the previous record.
//!
//! Components:
//! - `types`: the persisted record, partial updates, and recovery results.
//! - `store`: the `SessionStore` trait with file and in-memory backends.
//! - `persistence`: `SessionPersistence`, throttled writes and the recovery query.

pub mod persistence;
pub mod store;
pub mod types;

pub use persistence::SessionPersistence;
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use types::{
    CleanupReport, PersistedSession, PersistedStatus, PurgeReason, RecoveryInfo, SessionUpdate,
    SCHEMA_VERSION,
};
