//! Time abstraction for testable time-dependent operations
//!
//! The state engine stamps registrations, heartbeats, messages, and context
//! writes through a `TimeProvider`, and the reaper compares those stamps
//! against its staleness threshold. Injecting a manual clock lets tests
//! advance time without real waiting; production uses the system clock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of the current wall-clock time
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// The current time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared handle to a time provider
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// System clock, for production use
#[derive(Debug, Clone, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock, for tests
///
/// Starts at the real current time and only moves when `advance` is called.
#[derive(Debug)]
pub struct ManualTimeProvider {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTimeProvider {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }

    /// Moves the clock forward by `step`.
    pub fn advance(&self, step: Duration) {
        let mut now = self.now.lock().expect("manual clock lock poisoned");
        *now += ChronoDuration::from_std(step).expect("advance step out of range");
    }
}

impl Default for ManualTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("manual clock lock poisoned")
    }
}

/// Create the production time provider.
pub fn system_time_provider() -> SharedTimeProvider {
    Arc::new(SystemTimeProvider)
}
