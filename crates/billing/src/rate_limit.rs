//! Minimum-interval guard for reconciliation triggers
//!
//! Advisory only: it keeps redundant triggers from re-running a pass within
//! the window, it does not serialize passes started elsewhere (e.g. the
//! worker's schedule). One guard per process/instance.

use std::time::Duration;

use stagehand_shared::SharedClock;
use time::OffsetDateTime;
use tokio::sync::Mutex;

/// Default minimum time between two triggered passes
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of a trigger attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    Run,
    /// Inside the window; seconds until the next run would be allowed
    RateLimited { retry_after_seconds: u64 },
}

impl TriggerDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, TriggerDecision::Run)
    }
}

pub struct SyncTriggerGuard {
    clock: SharedClock,
    min_interval: time::Duration,
    last_run: Mutex<Option<OffsetDateTime>>,
}

impl SyncTriggerGuard {
    pub fn new(clock: SharedClock, min_interval: Duration) -> Self {
        Self {
            clock,
            min_interval: time::Duration::try_from(min_interval)
                .unwrap_or(time::Duration::seconds(60)),
            last_run: Mutex::new(None),
        }
    }

    /// Claim the right to run a pass now
    ///
    /// The claim is recorded before the pass runs, so a failing pass still
    /// holds the window.
    pub async fn try_acquire(&self) -> TriggerDecision {
        let now = self.clock.now();
        let mut last_run = self.last_run.lock().await;

        if let Some(last) = *last_run {
            let elapsed = now - last;
            if elapsed < self.min_interval {
                let remaining = self.min_interval - elapsed;
                let retry_after_seconds = remaining.whole_seconds().max(0) as u64
                    + u64::from(remaining.subsec_nanoseconds() > 0);
                tracing::debug!(
                    last_run = %last,
                    retry_after_seconds,
                    "Reconciliation trigger inside minimum interval"
                );
                return TriggerDecision::RateLimited {
                    retry_after_seconds,
                };
            }
        }

        *last_run = Some(now);
        TriggerDecision::Run
    }

    pub async fn last_run(&self) -> Option<OffsetDateTime> {
        *self.last_run.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_shared::ManualClock;
    use std::sync::Arc;
    use time::macros::datetime;

    fn guard() -> (SyncTriggerGuard, ManualClock) {
        let clock = ManualClock::new(datetime!(2026-03-01 12:00 UTC));
        let guard = SyncTriggerGuard::new(Arc::new(clock.clone()), DEFAULT_MIN_INTERVAL);
        (guard, clock)
    }

    #[tokio::test]
    async fn test_first_trigger_runs() {
        let (guard, clock) = guard();
        assert_eq!(guard.try_acquire().await, TriggerDecision::Run);
        assert_eq!(guard.last_run().await, Some(clock_now(&clock)));
    }

    #[tokio::test]
    async fn test_second_trigger_within_window_is_limited() {
        let (guard, clock) = guard();
        assert!(guard.try_acquire().await.allowed());

        clock.advance(time::Duration::seconds(59));
        assert_eq!(
            guard.try_acquire().await,
            TriggerDecision::RateLimited {
                retry_after_seconds: 1
            }
        );

        // A limited attempt does not move the window
        clock.advance(time::Duration::seconds(1));
        assert!(guard.try_acquire().await.allowed());
    }

    #[tokio::test]
    async fn test_partial_seconds_round_up() {
        let (guard, clock) = guard();
        guard.try_acquire().await;
        clock.advance(time::Duration::milliseconds(30_500));
        assert_eq!(
            guard.try_acquire().await,
            TriggerDecision::RateLimited {
                retry_after_seconds: 30
            }
        );
    }

    fn clock_now(clock: &ManualClock) -> OffsetDateTime {
        use stagehand_shared::Clock;
        clock.now()
    }
}
