//! Time source
//!
//! Every expiry comparison in the billing code goes through a [`Clock`] so
//! that reconciliation and rate limiting can be driven deterministically in
//! tests.

use std::sync::{Arc, Mutex};

use time::{Duration, OffsetDateTime};

/// Supplies the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Clock handle shared between services
pub type SharedClock = Arc<dyn Clock>;

/// Real UTC wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OffsetDateTime> {
        // A poisoned clock still holds a valid timestamp
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2026-03-01 12:00 UTC));
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), datetime!(2026-03-01 12:01:30 UTC));

        clock.set(datetime!(2026-01-01 00:00 UTC));
        assert_eq!(clock.now(), datetime!(2026-01-01 00:00 UTC));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(datetime!(2026-03-01 12:00 UTC));
        let shared: SharedClock = Arc::new(clock.clone());
        clock.advance(Duration::hours(1));
        assert_eq!(shared.now(), datetime!(2026-03-01 13:00 UTC));
    }
}
