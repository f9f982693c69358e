use super::types::*;
use crate::error_handling::types::ConfigError;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the directory of the durable session record.
pub const DATA_DIR_ENV: &str = "CAPTURE_RELAY_DATA_DIR";

/// Application configuration structure that defines all runtime parameters.
///
/// This structure holds the complete configuration for the relay: how chunks
/// are uploaded, where the crash-recovery snapshot lives, capture timing, and
/// which transport strategy delivers the bytes. It is read from a TOML file
/// whose sections are all optional.
///
/// # Examples
///
/// ```
/// use capture_relay::configuration::config::Config;
///
/// let config = Config::from_toml_str("[upload]\nconcurrency = 2\n").unwrap();
/// assert_eq!(config.upload.concurrency, 2);
/// assert_eq!(config.upload.max_retries, 3);
/// ```
///
/// # Fields Overview
///
/// - `upload`: concurrency, retry/backoff and timeout settings of the upload queue
/// - `persistence`: location and staleness windows of the session snapshot
/// - `capture`: duration clock tick, snapshot threshold, stop watchdog, chunk timeslice
/// - `transport`: delivery strategy (backend proxy, signed URL, or local directory)
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upload: UploadConfig,
    pub persistence: PersistenceConfig,
    pub capture: CaptureConfig,
    pub transport: TransportConfig,
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let raw = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the relay cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let upload = &self.upload;
        if upload.concurrency == 0 {
            return Err(ConfigError::NotInRange(
                "upload.concurrency must be at least 1".to_string(),
            ));
        }
        if upload.timeout_ms == 0 {
            return Err(ConfigError::NotInRange(
                "upload.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if upload.retry_delay_ms > upload.max_retry_delay_ms {
            return Err(ConfigError::NotInRange(format!(
                "upload.retry_delay_ms ({}) exceeds upload.max_retry_delay_ms ({})",
                upload.retry_delay_ms, upload.max_retry_delay_ms
            )));
        }
        if upload.max_chunk_bytes == 0 {
            return Err(ConfigError::NotInRange(
                "upload.max_chunk_bytes must be greater than 0".to_string(),
            ));
        }

        let persistence = &self.persistence;
        if persistence.staleness_minutes > PersistenceConfig::MAX_WINDOW_MINUTES {
            return Err(ConfigError::NotInRange(format!(
                "persistence.staleness_minutes ({}) exceeds {}",
                persistence.staleness_minutes,
                PersistenceConfig::MAX_WINDOW_MINUTES
            )));
        }
        if persistence.throttle_secs < PersistenceConfig::MIN_THROTTLE_SECS {
            return Err(ConfigError::NotInRange(format!(
                "persistence.throttle_secs ({}) must be at least {}",
                persistence.throttle_secs,
                PersistenceConfig::MIN_THROTTLE_SECS
            )));
        }
        if persistence.auto_recover_minutes > persistence.staleness_minutes {
            return Err(ConfigError::NotInRange(format!(
                "persistence.auto_recover_minutes ({}) exceeds persistence.staleness_minutes ({})",
                persistence.auto_recover_minutes, persistence.staleness_minutes
            )));
        }

        let capture = &self.capture;
        if capture.persist_threshold_secs == 0 {
            return Err(ConfigError::NotInRange(
                "capture.persist_threshold_secs must be greater than 0".to_string(),
            ));
        }
        if capture.tick_interval_ms == 0 || capture.timeslice_ms == 0 {
            return Err(ConfigError::NotInRange(
                "capture.tick_interval_ms and capture.timeslice_ms must be greater than 0"
                    .to_string(),
            ));
        }
        if !CaptureConfig::ALLOWED_FORMATS.contains(&capture.extension()) {
            return Err(ConfigError::InvalidValue(format!(
                "capture.mime_type '{}' is not one of {:?}",
                capture.mime_type,
                CaptureConfig::ALLOWED_FORMATS
            )));
        }

        match self.transport.kind {
            TransportKind::Backend | TransportKind::SignedUrl => {
                if self.transport.base_url.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "transport.base_url is required for HTTP transports".to_string(),
                    ));
                }
            }
            TransportKind::File => {}
        }

        Ok(())
    }

    /// Directory of the durable session record: the configured one, then
    /// `CAPTURE_RELAY_DATA_DIR`, then the current directory.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.persistence.data_dir {
            return Ok(dir.clone());
        }
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            info!("Using session data directory from {}: {}", DATA_DIR_ENV, dir);
            return Ok(PathBuf::from(dir));
        }
        Ok(std::env::current_dir()?)
    }

    /// Target directory of the file transport, defaulting to `<data_dir>/chunks`.
    pub fn chunk_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.transport.directory {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("chunks")),
        }
    }
}
