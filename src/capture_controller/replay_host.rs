//! Replays a media file as a capture source.
//!
//! The file plays the role of the screen: every timeslice the next
//! `slice_bytes` of it are emitted as a chunk, and reaching the end of the
//! file ends the source. Lets the full capture pipeline run from the command
//! line without a platform capture API.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error_handling::types::{CaptureError, PermissionError, PermissionErrorKind};

use super::host::CaptureHost;
use super::types::{CaptureEvent, CaptureStream, EventSink, TrackInfo};

pub const DEFAULT_SLICE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Pause,
    Resume,
    Flush,
    Stop,
}

#[derive(Default)]
struct ReplayState {
    control: Option<mpsc::UnboundedSender<Control>>,
    streams_started: u64,
}

pub struct ReplayCaptureHost {
    path: PathBuf,
    slice_bytes: usize,
    state: Mutex<ReplayState>,
}

impl ReplayCaptureHost {
    pub fn new<P: AsRef<Path>>(path: P, slice_bytes: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            slice_bytes: slice_bytes.max(1),
            state: Mutex::new(ReplayState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, control: Control) -> Result<(), CaptureError> {
        let state = self.state();
        match &state.control {
            Some(tx) if tx.send(control).is_ok() => Ok(()),
            _ => Err(CaptureError::Facility(format!(
                "replay of {} is not running",
                self.path.display()
            ))),
        }
    }

    /// Reads up to `slice_bytes` from `file`; an empty result means EOF.
    async fn read_slice(file: &mut File, slice_bytes: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(slice_bytes);
        file.take(slice_bytes as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn play(
        mut file: File,
        slice_bytes: usize,
        timeslice: Duration,
        sink: EventSink,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        let mut ticker = interval_at(Instant::now() + timeslice, timeslice);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut paused = false;
        let mut exhausted = false;

        loop {
            let emit = tokio::select! {
                _ = ticker.tick(), if !paused && !exhausted => true,
                cmd = control.recv() => match cmd {
                    Some(Control::Pause) => { paused = true; false }
                    Some(Control::Resume) => { paused = false; false }
                    Some(Control::Flush) => !exhausted,
                    Some(Control::Stop) | None => {
                        trace!("replay stopped");
                        sink.send(CaptureEvent::FacilityStopped);
                        return;
                    }
                },
            };
            if !emit {
                continue;
            }

            match Self::read_slice(&mut file, slice_bytes).await {
                Ok(slice) if slice.is_empty() => {
                    debug!("replay reached end of file");
                    exhausted = true;
                    sink.send(CaptureEvent::SourceEnded);
                }
                Ok(slice) => {
                    trace!("replay emitting {} bytes", slice.len());
                    sink.send(CaptureEvent::DataAvailable(Bytes::from(slice)));
                }
                Err(e) => {
                    warn!("replay read failed: {}", e);
                    exhausted = true;
                    sink.send(CaptureEvent::FacilityError(e.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl CaptureHost for ReplayCaptureHost {
    async fn request_capture(&self) -> Result<CaptureStream, PermissionError> {
        let meta = tokio::fs::metadata(&self.path).await.map_err(|e| {
            PermissionError::new(
                PermissionErrorKind::NoSource,
                format!("{}: {}", self.path.display(), e),
            )
        })?;
        if !meta.is_file() {
            return Err(PermissionError::new(
                PermissionErrorKind::NoSource,
                format!("{} is not a file", self.path.display()),
            ));
        }

        let n = {
            let mut state = self.state();
            state.streams_started += 1;
            state.streams_started
        };
        let label = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "replay".to_string());
        let mut stream = CaptureStream::new(
            format!("replay-{}", n),
            vec![TrackInfo::video(format!("replay-{}-video", n), label)],
        );
        stream.metadata.insert(
            "source".to_string(),
            serde_json::json!(self.path.display().to_string()),
        );
        stream
            .metadata
            .insert("source_bytes".to_string(), serde_json::json!(meta.len()));
        Ok(stream)
    }

    async fn start_facility(
        &self,
        stream: &CaptureStream,
        timeslice: Duration,
        sink: EventSink,
    ) -> Result<(), CaptureError> {
        let file = File::open(&self.path).await.map_err(|e| {
            CaptureError::Facility(format!("{}: {}", self.path.display(), e))
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(previous) = self.state().control.replace(tx) {
            let _ = previous.send(Control::Stop);
        }
        info!(
            "Replaying {} as {} ({} bytes every {:?})",
            self.path.display(),
            stream.id,
            self.slice_bytes,
            timeslice
        );
        tokio::spawn(Self::play(file, self.slice_bytes, timeslice, sink, rx));
        Ok(())
    }

    async fn pause_facility(&self) -> Result<(), CaptureError> {
        self.send(Control::Pause)
    }

    async fn resume_facility(&self) -> Result<(), CaptureError> {
        self.send(Control::Resume)
    }

    async fn request_data(&self) -> Result<(), CaptureError> {
        self.send(Control::Flush)
    }

    async fn stop_facility(&self) -> Result<(), CaptureError> {
        let result = self.send(Control::Stop);
        self.state().control = None;
        result
    }

    fn stop_tracks(&self, stream: &CaptureStream) {
        debug!("Releasing replay stream {}", stream.id);
    }

    fn name(&self) -> &str {
        "replay"
    }
}
