use std::time::Duration;
use tokio::time::Instant;

const DROP_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    /// Frames skipped on this tick because the loop fell behind.
    pub dropped: u64,
    /// When the following tick is due.
    pub next_at: Instant,
}

/// Fixed-interval scheduler with drift correction.
///
/// Deadlines are derived from the first tick (`origin + n * period`) rather
/// than from the previous tick, so lateness never accumulates. A tick that
/// arrives more than one period late skips the frames it missed instead of
/// running them back to back.
#[derive(Debug)]
pub struct FrameScheduler {
    period: Duration,
    origin: Option<Instant>,
    frame: u64,
    dropped: u64,
    last_log: Option<Instant>,
}

impl FrameScheduler {
    pub fn new(fps: u32) -> Self {
        Self::with_period(Duration::from_secs_f64(1.0 / fps.max(1) as f64))
    }

    pub fn with_period(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            origin: None,
            frame: 0,
            dropped: 0,
            last_log: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn deadline(&self, origin: Instant, frame: u64) -> Instant {
        origin + self.period.saturating_mul(frame.min(u32::MAX as u64) as u32)
    }

    pub fn tick(&mut self, now: Instant) -> TickPlan {
        let origin = *self.origin.get_or_insert(now);
        let expected = self.deadline(origin, self.frame);

        let mut dropped = 0;
        let lag = now.saturating_duration_since(expected);
        if lag > self.period {
            dropped = (lag.as_nanos() / self.period.as_nanos()) as u64;
            self.frame += dropped;
            self.dropped += dropped;
        }

        self.frame += 1;
        TickPlan {
            dropped,
            next_at: self.deadline(origin, self.frame),
        }
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped
    }

    /// True at most once per five seconds, and only once frames were dropped.
    pub fn should_log(&mut self, now: Instant) -> bool {
        if self.dropped == 0 {
            return false;
        }
        match self.last_log {
            Some(last) if now.saturating_duration_since(last) < DROP_LOG_INTERVAL => false,
            _ => {
                self.last_log = Some(now);
                true
            }
        }
    }
}
