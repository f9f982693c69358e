use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use capture_relay::capture_controller::replay_host::DEFAULT_SLICE_BYTES;
use capture_relay::capture_controller::{CaptureController, CaptureStatus, ReplayCaptureHost};
use capture_relay::configuration::config::Config;
use capture_relay::session_persistence::{FileSessionStore, SessionPersistence};
use capture_relay::transport::{self, CompletionSummary};
use capture_relay::upload_queue::{DeliveryOutcome, QueueEvent, UploadQueue};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "capture-relay")]
#[command(version = "0.0.2")]
#[command(about = "Crash-recoverable capture recording with chunked, retrying upload")]
struct Args {
    #[arg(env = "CAPTURE_RELAY_CONFIG")]
    config_file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Purge unusable session records and report a recoverable one
    Recover,
    /// Forget the persisted session record
    Discard,
    /// Upload files as the chunks of one session, in the given order
    Upload {
        /// Session the chunks belong to (a new one by default)
        #[arg(long)]
        session: Option<Uuid>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Record a session from a media file replayed as the capture source
    Record {
        #[arg(long)]
        source: PathBuf,
        /// Bytes emitted per timeslice
        #[arg(long, default_value_t = DEFAULT_SLICE_BYTES)]
        slice_bytes: usize,
        /// Continue the persisted session instead of starting a new one
        #[arg(long)]
        resume: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    println!(
        "
==============================================================================
                            capture-relay v0.0.2
          crash-recoverable capture with chunked, retrying delivery
==============================================================================
"
    );

    let args = Args::parse();

    if args.config_file.is_empty() {
        error!("No configuration file found");
        std::process::exit(1);
    }

    info!("Importing configuration");
    let config = Config::from_file(Path::new(args.config_file.as_str())).unwrap_or_else(|e| {
        error!("Unable to import configuration from file: {}", e);
        std::process::exit(1);
    });
    info!("Configuration imported successfully");

    let persistence = open_persistence(&config);

    let ok = match args.command {
        Command::Recover => recover(&persistence),
        Command::Discard => match persistence.clear_session() {
            Ok(()) => true,
            Err(e) => {
                error!("Unable to discard the session record: {}", e);
                false
            }
        },
        Command::Upload { session, files } => upload(&config, session, files).await,
        Command::Record {
            source,
            slice_bytes,
            resume,
        } => record(&config, persistence, source, slice_bytes, resume).await,
    };

    if !ok {
        std::process::exit(1);
    }
}

fn open_persistence(config: &Config) -> Arc<SessionPersistence> {
    let dir = config.data_dir().unwrap_or_else(|e| {
        error!("Unable to resolve the data directory: {}", e);
        std::process::exit(1);
    });
    let store = FileSessionStore::new(dir).unwrap_or_else(|e| {
        error!("Unable to open the session store: {}", e);
        std::process::exit(1);
    });
    Arc::new(SessionPersistence::new(
        Arc::new(store),
        config.persistence.clone(),
    ))
}

fn build_queue(config: &Config) -> Option<UploadQueue> {
    let transport = match transport::from_config(config) {
        Ok(transport) => transport,
        Err(e) => {
            error!("Unable to create the transport: {}", e);
            return None;
        }
    };
    let queue = UploadQueue::new(config.upload.clone(), transport);
    queue.add_listener(|event, progress| match event {
        QueueEvent::Succeeded { job, .. } => info!(
            "[{}] chunk {} delivered: {}/{} chunk(s), {:.0}%",
            job.session_id,
            job.chunk_index,
            progress.completed_chunks,
            progress.total_chunks,
            progress.percentage
        ),
        QueueEvent::SessionDeliveryFailed { session_id } => {
            error!("[{}] session delivery failed", session_id)
        }
        _ => {}
    });
    Some(queue)
}

/// Waits for every chunk of `session_id`, then reports completion to the
/// transport if all of them were delivered.
async fn finish_delivery(queue: &UploadQueue, session_id: Uuid, duration: Duration) -> bool {
    queue.wait_idle().await;
    let progress = queue.progress_for(session_id);
    match queue.session_outcome(session_id) {
        DeliveryOutcome::Delivered => {
            let summary = CompletionSummary {
                duration_seconds: duration.as_secs(),
                total_file_size_bytes: progress.total_bytes,
                chunk_count: progress.total_chunks,
            };
            if let Err(e) = queue.transport().finalize(session_id, &summary).await {
                error!("[{}] completion report failed: {}", session_id, e);
                return false;
            }
            info!(
                "[{}] delivered {} chunk(s), {} bytes",
                session_id, progress.total_chunks, progress.total_bytes
            );
            true
        }
        outcome => {
            error!(
                "[{}] delivery {:?}: {}/{} chunk(s) delivered; run again after fixing the transport",
                session_id, outcome, progress.completed_chunks, progress.total_chunks
            );
            false
        }
    }
}

fn recover(persistence: &SessionPersistence) -> bool {
    let report = persistence.cleanup();
    if let Some(reason) = &report.purged {
        info!("Removed session record: {:?}", reason);
    }
    let recovery = persistence.check_recovery();
    match &recovery.session_data {
        Some(record) if recovery.has_recoverable_session => {
            info!(
                "[{}] recoverable session ({:?}), auto-recover: {}",
                record.session_id, record.status, recovery.should_auto_recover
            );
            match serde_json::to_string_pretty(record) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Unable to print the session record: {}", e),
            }
        }
        _ => info!("No recoverable session"),
    }
    true
}

async fn upload(config: &Config, session: Option<Uuid>, files: Vec<PathBuf>) -> bool {
    let Some(queue) = build_queue(config) else {
        return false;
    };
    let session_id = session.unwrap_or_else(Uuid::new_v4);
    info!("[{}] uploading {} file(s)", session_id, files.len());

    for (index, file) in files.iter().enumerate() {
        let payload = match tokio::fs::read(file).await {
            Ok(payload) => payload,
            Err(e) => {
                error!("Unable to read {}: {}", file.display(), e);
                queue.cancel_all();
                return false;
            }
        };
        if let Err(e) = queue.add_chunk(session_id, index as u64, payload) {
            error!("[{}] {} not queued: {}", session_id, file.display(), e);
            queue.cancel_all();
            return false;
        }
    }

    finish_delivery(&queue, session_id, Duration::ZERO).await
}

async fn record(
    config: &Config,
    persistence: Arc<SessionPersistence>,
    source: PathBuf,
    slice_bytes: usize,
    resume: bool,
) -> bool {
    let Some(queue) = build_queue(config) else {
        return false;
    };
    let host = Arc::new(ReplayCaptureHost::new(&source, slice_bytes));
    let mut controller = CaptureController::new(
        config.capture.clone(),
        host,
        queue.clone(),
        Arc::clone(&persistence),
    );
    controller.on_complete(|id| info!("[{}] capture handed off for delivery", id));
    controller.on_error(|e| error!("{}", e));

    persistence.cleanup();
    let recovery = persistence.check_recovery();
    if let Some(previous) = recovery.session_data {
        if resume || recovery.should_auto_recover {
            if let Err(e) = controller.restore(previous) {
                error!("Unable to restore the previous session: {}", e);
                return false;
            }
        } else {
            warn!(
                "[{}] unfinished session will be replaced; pass --resume to continue it",
                previous.session_id
            );
        }
    } else if resume {
        warn!("Nothing to resume; starting a new session");
    }

    let session_id = match controller.start_recording().await {
        Ok(id) => id,
        Err(e) => {
            error!("Unable to start recording: {}", e);
            return false;
        }
    };
    info!("[{}] recording {}; Ctrl-C stops", session_id, source.display());

    while controller.status().is_active() || controller.status() == CaptureStatus::Stopping {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping recording");
                controller.stop_recording().await;
            }
            event = controller.next_event() => controller.handle_event(event).await,
        }
    }

    let captured = controller.status() != CaptureStatus::Error;
    let delivered = finish_delivery(&queue, session_id, controller.duration()).await;
    captured && delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_record_command() {
        let args = Args::try_parse_from([
            "capture-relay",
            "relay.toml",
            "record",
            "--source",
            "screen.webm",
            "--resume",
        ])
        .unwrap();
        assert_eq!(args.config_file, "relay.toml");
        match args.command {
            Command::Record {
                source,
                slice_bytes,
                resume,
            } => {
                assert_eq!(source, PathBuf::from("screen.webm"));
                assert_eq!(slice_bytes, DEFAULT_SLICE_BYTES);
                assert!(resume);
            }
            _ => panic!("expected record"),
        }
    }

    #[test]
    fn upload_requires_files() {
        assert!(Args::try_parse_from(["capture-relay", "relay.toml", "upload"]).is_err());
        let session = Uuid::new_v4().to_string();
        let args = Args::try_parse_from([
            "capture-relay",
            "relay.toml",
            "upload",
            "--session",
            session.as_str(),
            "a.webm",
            "b.webm",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::Upload { files, .. } if files.len() == 2));
    }
}
