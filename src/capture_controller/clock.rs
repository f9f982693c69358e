use std::time::Duration;

use tokio::time::Instant;

/// Active-time accounting across pause/resume.
///
/// Keeps the accumulated duration of finished segments plus the start of the
/// running segment. Pausing and stopping fold the running segment into the
/// total, so paused intervals never enter it. Paused time is tracked on the
/// side for diagnostics only.
#[derive(Debug, Clone, Default)]
pub struct DurationClock {
    accumulated: Duration,
    segment_start: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl DurationClock {
    /// Starts a fresh clock at `base` (zero for new sessions, the persisted
    /// duration for recovered ones).
    pub fn start_from(&mut self, base: Duration) {
        *self = Self {
            accumulated: base,
            segment_start: Some(Instant::now()),
            ..Default::default()
        };
    }

    /// Returns false if the clock was not running.
    pub fn pause(&mut self) -> bool {
        let Some(start) = self.segment_start.take() else {
            return false;
        };
        let now = Instant::now();
        self.accumulated += now - start;
        self.paused_at = Some(now);
        true
    }

    /// Returns false if the clock was not paused.
    pub fn resume(&mut self) -> bool {
        let Some(paused_at) = self.paused_at.take() else {
            return false;
        };
        let now = Instant::now();
        self.paused_total += now - paused_at;
        self.segment_start = Some(now);
        true
    }

    /// Folds the running segment and freezes the total.
    pub fn stop(&mut self) -> Duration {
        if let Some(start) = self.segment_start.take() {
            self.accumulated += Instant::now() - start;
        }
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += Instant::now() - paused_at;
        }
        self.accumulated
    }

    pub fn elapsed(&self) -> Duration {
        match self.segment_start {
            Some(start) => self.accumulated + (Instant::now() - start),
            None => self.accumulated,
        }
    }

    pub fn is_running(&self) -> bool {
        self.segment_start.is_some()
    }

    pub fn paused_total(&self) -> Duration {
        self.paused_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn paused_intervals_are_excluded() {
        let mut clock = DurationClock::default();
        clock.start_from(Duration::ZERO);
        advance(Duration::from_secs(10)).await;
        assert!(clock.pause());
        assert!(!clock.pause());
        advance(Duration::from_secs(60)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
        assert!(clock.resume());
        advance(Duration::from_secs(3)).await;
        assert_eq!(clock.stop(), Duration::from_secs(13));
        assert_eq!(clock.paused_total(), Duration::from_secs(60));

        advance(Duration::from_secs(30)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(13));
        assert!(!clock.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_clock_continues_from_base() {
        let mut clock = DurationClock::default();
        clock.start_from(Duration::from_secs(90));
        advance(Duration::from_secs(5)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(95));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_paused_keeps_total() {
        let mut clock = DurationClock::default();
        clock.start_from(Duration::ZERO);
        advance(Duration::from_secs(4)).await;
        clock.pause();
        advance(Duration::from_secs(4)).await;
        assert_eq!(clock.stop(), Duration::from_secs(4));
        assert!(!clock.resume());
    }
}
