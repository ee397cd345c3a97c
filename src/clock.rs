//! Time source abstraction
//!
//! Freshness classification is a function of "now". Every tier and the
//! coordinator read time through a [`Clock`] so that tests and simulations can
//! drive virtual time with [`ManualClock`] instead of sleeping.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::time::Duration;

/// Source of wall-clock time for cache metadata
pub trait Clock: Send + Sync + Debug {
    /// Current time in UTC
    fn now(&self) -> DateTime<Utc>;
}

/// Real system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock
///
/// Starts at the time it was created (or a given instant) and only moves when
/// [`ManualClock::advance`] or [`ManualClock::set`] is called.
///
/// ```rust
/// use lopan_cache::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(200));
/// assert_eq!((clock.now() - start).num_seconds(), 200);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at the current system time
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a clock frozen at `start`
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move time forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Some(next) = TimeDelta::from_std(by)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
        {
            *now = next;
        }
    }

    /// Jump to an absolute instant
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
