//! Subscription management

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stagehand_shared::{SharedClock, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// A user's paid plan
///
/// Created at checkout completion by the payment integration and never
/// deleted; the reconciler moves it to `expired` once its period ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub price_id: String,
    pub status: SubscriptionStatus,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// New active subscription, not yet persisted
    pub fn new(
        user_id: Uuid,
        price_id: &str,
        current_period_end: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            price_id: price_id.to_string(),
            status: SubscriptionStatus::Active,
            current_period_end,
            cancel_at_period_end: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Live and past its period end
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.status.is_live() && self.current_period_end <= now
    }
}

/// User-facing subscription operations
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    clock: SharedClock,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// The user's most recent subscription
    pub async fn get_for_user(&self, user_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .latest_subscription_for_user(user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(user_id))
    }

    /// Set or clear cancel-at-period-end
    ///
    /// Only the flag changes. Status and entitlements are left for the
    /// reconciler to act on once the period end passes.
    pub async fn set_cancel_at_period_end(
        &self,
        user_id: Uuid,
        cancel_at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let now = self.clock.now();
        let subscription = self
            .store
            .set_cancel_at_period_end(user_id, cancel_at_period_end, now)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(user_id))?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            cancel_at_period_end = cancel_at_period_end,
            period_end = %subscription.current_period_end,
            "Updated cancel-at-period-end"
        );

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryBillingStore;
    use stagehand_shared::{Clock, ManualClock};
    use time::macros::datetime;
    use time::Duration;

    fn setup() -> (Arc<MemoryBillingStore>, SubscriptionService, ManualClock) {
        let clock = ManualClock::new(datetime!(2026-03-01 12:00 UTC));
        let store = Arc::new(MemoryBillingStore::new());
        let service = SubscriptionService::new(store.clone(), Arc::new(clock.clone()));
        (store, service, clock)
    }

    #[tokio::test]
    async fn test_cancel_flag_without_subscription_is_not_found() {
        let (_store, service, _clock) = setup();
        let user_id = Uuid::new_v4();

        let err = service
            .set_cancel_at_period_end(user_id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotFound(id) if id == user_id));
    }

    #[tokio::test]
    async fn test_cancel_flag_round_trips_requested_value() {
        let (store, service, clock) = setup();
        let user_id = Uuid::new_v4();
        let sub = Subscription::new(
            user_id,
            "price_pro_monthly",
            clock.now() + Duration::days(12),
            clock.now(),
        );
        store.insert_subscription(sub.clone()).await;

        let updated = service.set_cancel_at_period_end(user_id, true).await.unwrap();
        assert!(updated.cancel_at_period_end);
        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert_eq!(updated.current_period_end, sub.current_period_end);
        assert_eq!(updated.version, sub.version + 1);

        let updated = service
            .set_cancel_at_period_end(user_id, false)
            .await
            .unwrap();
        assert!(!updated.cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_cancel_flag_targets_latest_subscription() {
        let (store, service, clock) = setup();
        let user_id = Uuid::new_v4();
        let old = Subscription::new(
            user_id,
            "price_basic_monthly",
            clock.now() - Duration::days(40),
            clock.now() - Duration::days(70),
        );
        let current = Subscription::new(
            user_id,
            "price_pro_monthly",
            clock.now() + Duration::days(20),
            clock.now() - Duration::days(10),
        );
        store.insert_subscription(old.clone()).await;
        store.insert_subscription(current.clone()).await;

        let updated = service.set_cancel_at_period_end(user_id, true).await.unwrap();
        assert_eq!(updated.id, current.id);
        assert!(!store.subscription(old.id).await.unwrap().cancel_at_period_end);
    }

    #[test]
    fn test_is_due_requires_live_status() {
        let now = datetime!(2026-03-01 12:00 UTC);
        let mut sub = Subscription::new(Uuid::new_v4(), "price", now - Duration::days(1), now);
        assert!(sub.is_due(now));

        sub.status = SubscriptionStatus::Canceled;
        assert!(sub.is_due(now));

        sub.status = SubscriptionStatus::Expired;
        assert!(!sub.is_due(now));

        sub.status = SubscriptionStatus::Active;
        sub.current_period_end = now + Duration::hours(1);
        assert!(!sub.is_due(now));
    }
}
