//! Crash-recoverable screen capture with chunked, retrying delivery.
//!
//! Leaves first: `transport` performs one upload, `upload_queue` schedules
//! uploads with bounded concurrency and backoff, `session_persistence` keeps
//! a durable snapshot of the active session, and `capture_controller`
//! composes the three around the capture lifecycle.

pub mod capture_controller;
pub mod configuration;
pub mod error_handling;
pub mod session_persistence;
pub mod transport;
pub mod upload_queue;
