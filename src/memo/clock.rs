use std::sync::atomic::{AtomicI64, Ordering};

use time::OffsetDateTime;

/// Wall-clock source with minute granularity.
pub trait Clock: Send + Sync + 'static {
    /// Whole minutes since the Unix epoch.
    fn now_minutes(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_minutes(&self) -> i64 {
        OffsetDateTime::now_utc().unix_timestamp().div_euclid(60)
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    minutes: AtomicI64,
}

impl ManualClock {
    pub fn new(minutes: i64) -> Self {
        Self {
            minutes: AtomicI64::new(minutes),
        }
    }

    pub fn set(&self, minutes: i64) {
        self.minutes.store(minutes, Ordering::SeqCst);
    }

    pub fn advance(&self, minutes: i64) {
        self.minutes.fetch_add(minutes, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_minutes(&self) -> i64 {
        self.minutes.load(Ordering::SeqCst)
    }
}
