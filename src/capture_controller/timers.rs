use std::time::Duration;

use log::trace;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::types::{CaptureEvent, EventSink};

/// An owned timer task that posts events into the controller's channel.
/// Cancelled on `cancel` and on drop.
#[derive(Debug)]
pub struct TimerHandle {
    label: &'static str,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Posts `event()` every `period`, first after one full period.
    pub fn interval(
        label: &'static str,
        period: Duration,
        sink: EventSink,
        event: fn() -> CaptureEvent,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !sink.send(event()) {
                    break;
                }
            }
        });
        trace!("timer '{}' armed every {:?}", label, period);
        Self { label, task }
    }

    /// Posts `event` once after `delay`.
    pub fn once(
        label: &'static str,
        delay: Duration,
        sink: EventSink,
        event: CaptureEvent,
    ) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.send(event);
        });
        trace!("timer '{}' armed for {:?}", label, delay);
        Self { label, task }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
        trace!("timer '{}' cancelled", self.label);
    }
}
