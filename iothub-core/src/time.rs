//! Wall-clock access for authentication timing and poll throttling

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Source of seconds since the Unix epoch
///
/// `None` means the clock is currently unavailable; callers decide how to
/// treat that (throttling allows the poll, authentication fails safe).
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Option<i64>;
}

/// Seconds elapsed between two readings
pub fn difftime(later: i64, earlier: i64) -> i64 {
    later - earlier
}

/// System clock backed by `chrono::Utc`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Option<i64> {
        Some(Utc::now().timestamp())
    }
}

/// Manually driven clock, shared between clones
#[derive(Debug, Clone)]
pub struct ManualClock {
    seconds: Arc<AtomicI64>,
    available: Arc<AtomicBool>,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            seconds: Arc::new(AtomicI64::new(start)),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.seconds.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, seconds: i64) {
        self.seconds.store(seconds, Ordering::SeqCst);
    }

    /// Simulate a failing clock
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Option<i64> {
        if self.available.load(Ordering::SeqCst) {
            Some(self.seconds.load(Ordering::SeqCst))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        let shared = clock.clone();
        shared.advance(30);
        assert_eq!(clock.now(), Some(1_030));
        clock.set_available(false);
        assert_eq!(shared.now(), None);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now().unwrap() > 1_577_836_800);
        assert_eq!(difftime(10, 4), 6);
    }
}
