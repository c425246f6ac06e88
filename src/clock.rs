//! Time source for the supervisor and control loop
//!
//! The launch sequence sleeps for fixed settle/spin-up intervals and the
//! runtime cap measures session age, so both go through this trait and tests
//! can drive time by hand. Wall-clock timestamps are for display only; ages
//! are measured on the monotonic clock, which NTP steps do not move.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Real wall clock backed by `chrono::Utc` and `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Elapsed time between two timestamps, zero if `later` is before `earlier`
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or_default()
}
