//! Time Sources
//!
//! Expiry logic (registry liveness, invites, bans, lobby linger) reads time
//! through [`Clock`] so it can be driven by a manual clock in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of wall-clock time in unix seconds.
pub trait Clock: Send + Sync {
    /// Current time as fractional unix seconds.
    fn now(&self) -> f64;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Real system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

/// Manually advanced clock with millisecond resolution.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `secs`.
    pub fn new(secs: f64) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicU64::new((secs * 1000.0) as u64),
        })
    }

    /// Jump to an absolute time.
    pub fn set(&self, secs: f64) {
        self.millis.store((secs * 1000.0) as u64, Ordering::SeqCst);
    }

    /// Move forward by `secs`.
    pub fn advance(&self, secs: f64) {
        self.millis
            .fetch_add((secs * 1000.0) as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.millis.load(Ordering::SeqCst) as f64 / 1000.0
    }
}

/// A shared handle to the system clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10.0);
        assert_eq!(clock.now(), 10.0);
        clock.advance(1.5);
        assert_eq!(clock.now(), 11.5);
        clock.set(0.0);
        assert_eq!(clock.now(), 0.0);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // after 2020-01-01
        assert!(SystemClock.now() > 1_577_836_800.0);
    }
}
