//! Durable storage substrates for the session record.
//!
//! A store holds exactly one serialized record. `FileSessionStore` keeps it
//! in `<data_dir>/session.json`, replacing it atomically; `MemorySessionStore`
//! backs tests and embedders that persist elsewhere.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use log::{debug, error, info};

use crate::configuration::config::DATA_DIR_ENV;
use crate::error_handling::types::PersistenceError;

pub const RECORD_FILE_NAME: &str = "session.json";

/// Key-value record scoped to one client profile.
pub trait SessionStore: Send + Sync {
    /// Returns the raw record, or `None` if nothing is stored.
    fn load(&self) -> Result<Option<String>, PersistenceError>;

    /// Replaces the stored record.
    fn store(&self, record: &str) -> Result<(), PersistenceError>;

    /// Deletes the record. Removing an absent record is not an error.
    fn remove(&self) -> Result<(), PersistenceError>;

    fn describe(&self) -> String {
        "session store".to_string()
    }
}

pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            error!("Failed to create session dir {}: {}", dir.display(), e);
            PersistenceError::WriteFailed(format!("{}: {}", dir.display(), e))
        })?;
        let path = dir.join(RECORD_FILE_NAME);
        info!("Session record kept at {}", path.display());
        Ok(Self { path })
    }

    /// Uses `CAPTURE_RELAY_DATA_DIR` if set, otherwise the current directory.
    pub fn new_default() -> Result<Self, PersistenceError> {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            info!("Using session store from {}: {}", DATA_DIR_ENV, dir);
            return Self::new(PathBuf::from(dir));
        }
        let cwd = std::env::current_dir().map_err(|e| {
            error!("Failed to get current dir: {}", e);
            PersistenceError::ReadFailed(e.to_string())
        })?;
        Self::new(cwd)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<String>, PersistenceError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                error!("Failed to read session record {}: {}", self.path.display(), e);
                Err(PersistenceError::ReadFailed(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }

    fn store(&self, record: &str) -> Result<(), PersistenceError> {
        let tmp = self.tmp_path();
        fs::write(&tmp, record)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                error!("Failed to write session record {}: {}", self.path.display(), e);
                let _ = fs::remove_file(&tmp);
                PersistenceError::WriteFailed(format!("{}: {}", self.path.display(), e))
            })?;
        debug!("Wrote session record {} ({} bytes)", self.path.display(), record.len());
        Ok(())
    }

    fn remove(&self) -> Result<(), PersistenceError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed session record {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("Failed to remove session record {}: {}", self.path.display(), e);
                Err(PersistenceError::WriteFailed(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory store. Writes can be made to fail to exercise best-effort paths.
#[derive(Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<String>>,
    fail_writes: AtomicBool,
    loads: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Stores raw text as-is, bypassing serialization.
    pub fn put_raw(&self, raw: impl Into<String>) {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = Some(raw.into());
    }

    pub fn raw(&self) -> Option<String> {
        self.record
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of `load` calls so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<String>, PersistenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.raw())
    }

    fn store(&self, record: &str) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteFailed("memory store is read-only".into()));
        }
        self.put_raw(record);
        Ok(())
    }

    fn remove(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteFailed("memory store is read-only".into()));
        }
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn file_store_replaces_and_removes_record() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().join("nested")).unwrap();
        assert_eq!(store.load().unwrap(), None);

        store.store("{\"a\":1}").unwrap();
        store.store("{\"a\":2}").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("{\"a\":2}"));
        assert!(!store.tmp_path().exists());

        store.remove().unwrap();
        store.remove().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    #[serial]
    fn default_store_honours_env_dir() {
        let dir = TempDir::new().unwrap();
        std::env::set_var(DATA_DIR_ENV, dir.path());
        let store = FileSessionStore::new_default().unwrap();
        std::env::remove_var(DATA_DIR_ENV);
        assert_eq!(store.path(), dir.path().join(RECORD_FILE_NAME));
    }

    #[test]
    fn memory_store_can_refuse_writes() {
        let store = MemorySessionStore::new();
        store.store("x").unwrap();
        store.set_fail_writes(true);
        assert!(matches!(
            store.store("y"),
            Err(PersistenceError::WriteFailed(_))
        ));
        assert_eq!(store.raw().as_deref(), Some("x"));
    }
}
