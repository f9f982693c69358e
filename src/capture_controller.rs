//! Capture controller
//!
//! Owns the capture lifecycle: permission, recording, pause/resume, stop,
//! duration accounting, and hand-off of captured chunks to the upload queue.
//!
//! Components:
//! - `controller`: the `CaptureController` state machine.
//! - `host`: the `CaptureHost` trait a platform capture API implements.
//! - `types`: statuses, streams, events, and the in-memory session.
//! - `clock`: active-time accounting across pause/resume.
//! - `timers`: owned, cancellable timer tasks.
//! - `replay_host`: a host that replays a media file.

pub mod clock;
pub mod controller;
pub mod host;
pub mod replay_host;
pub mod timers;
pub mod types;

pub use clock::DurationClock;
pub use controller::CaptureController;
pub use host::CaptureHost;
pub use replay_host::ReplayCaptureHost;
pub use timers::TimerHandle;
pub use types::{
    CaptureEvent, CaptureSession, CaptureStatus, CaptureStream, EventSink, TrackInfo, TrackKind,
};
