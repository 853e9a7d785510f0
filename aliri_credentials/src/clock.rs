//! Clocks used to judge whether an assertion is still usable
//!
//! Assertion lifetimes can be as short as a second, so these clocks work at
//! millisecond resolution rather than the whole seconds used for JWT claims.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

/// Represents a clock, which can tell the current time
pub trait Clock: fmt::Debug + Send + Sync {
    /// Gets the current time according to this clock
    fn now(&self) -> SystemTime;
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A test clock which maintains the current time as shared internal state
///
/// Clones share the same time, so a clone can be handed to a cache while the
/// test keeps another to move time forward.
#[derive(Clone, Debug, Default)]
pub struct TestClock {
    millis_since_epoch: Arc<AtomicU64>,
}

impl TestClock {
    /// Creates a new test clock with the specified time
    pub fn new(time: SystemTime) -> Self {
        let clock = Self::default();
        clock.set(time);
        clock
    }

    /// Updates the clock's current time to `val`
    ///
    /// Times before the Unix epoch are clamped to the epoch.
    pub fn set(&self, val: SystemTime) {
        let millis = val
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.millis_since_epoch.store(millis, Ordering::SeqCst);
    }

    /// Moves the clock's current time forward by `by`
    pub fn advance(&self, by: Duration) {
        self.millis_since_epoch
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(self.millis_since_epoch.load(Ordering::SeqCst))
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_clones_share_time() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = TestClock::new(start);
        let shared = clock.clone();

        clock.advance(Duration::from_millis(1_100));

        assert_eq!(shared.now(), start + Duration::from_millis(1_100));
    }

    #[test]
    fn test_clock_clamps_pre_epoch_times() {
        let clock = TestClock::new(SystemTime::UNIX_EPOCH - Duration::from_secs(5));

        assert_eq!(clock.now(), SystemTime::UNIX_EPOCH);
    }
}
