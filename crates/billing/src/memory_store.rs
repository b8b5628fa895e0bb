//! In-process [`BillingStore`]
//!
//! Backs the test suites and `STORE_BACKEND=memory` local runs. A single
//! lock is held for the whole of each operation, which gives every write the
//! same all-or-nothing behavior as the Postgres transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use stagehand_shared::{EntitlementKey, ProfileVisibility, SubscriptionStatus};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::profile::Profile;
use crate::store::{BillingStore, ExpiryPlan, GrantCandidate, PublishGrant};
use crate::subscriptions::Subscription;

#[derive(Default)]
struct State {
    subscriptions: HashMap<Uuid, Subscription>,
    entitlements: HashMap<Uuid, Entitlement>,
    profiles: HashMap<Uuid, Profile>,
}

impl State {
    fn subscriptions_where(&self, keep: impl Fn(&Subscription) -> bool) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .values()
            .filter(|s| keep(s))
            .cloned()
            .collect();
        subs.sort_by_key(|s| (s.current_period_end, s.id));
        subs
    }

    fn entitlements_where(&self, keep: impl Fn(&Entitlement) -> bool) -> Vec<Entitlement> {
        let mut rows: Vec<Entitlement> = self
            .entitlements
            .values()
            .filter(|e| keep(e))
            .cloned()
            .collect();
        rows.sort_by_key(|e| (e.created_at, e.id));
        rows
    }
}

#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<State>,
    calls: AtomicU64,
    writes: AtomicU64,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store operations served so far (seeding excluded)
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of operations that changed a row (seeding excluded)
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub async fn insert_entitlement(&self, entitlement: Entitlement) {
        self.state
            .lock()
            .await
            .entitlements
            .insert(entitlement.id, entitlement);
    }

    pub async fn insert_profile(&self, profile: Profile) {
        self.state
            .lock()
            .await
            .profiles
            .insert(profile.user_id, profile);
    }

    pub async fn subscription(&self, id: Uuid) -> Option<Subscription> {
        self.state.lock().await.subscriptions.get(&id).cloned()
    }

    pub async fn entitlement(&self, id: Uuid) -> Option<Entitlement> {
        self.state.lock().await.entitlements.get(&id).cloned()
    }

    pub async fn profile(&self, user_id: Uuid) -> Option<Profile> {
        self.state.lock().await.profiles.get(&user_id).cloned()
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn latest_subscription_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        self.record_call();
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn set_cancel_at_period_end(
        &self,
        user_id: Uuid,
        cancel_at_period_end: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        self.record_call();
        let mut state = self.state.lock().await;
        let latest = state
            .subscriptions
            .values_mut()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.created_at);

        let Some(sub) = latest else {
            return Ok(None);
        };
        sub.cancel_at_period_end = cancel_at_period_end;
        sub.version += 1;
        sub.updated_at = now;
        let updated = sub.clone();
        drop(state);

        self.record_write();
        Ok(Some(updated))
    }

    async fn list_due_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        self.record_call();
        let state = self.state.lock().await;
        Ok(state.subscriptions_where(|s| s.is_due(now)))
    }

    async fn list_live_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        self.record_call();
        let state = self.state.lock().await;
        Ok(state.subscriptions_where(|s| s.status.is_live() && s.current_period_end > now))
    }

    async fn list_grant_candidates(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<GrantCandidate>> {
        self.record_call();
        let state = self.state.lock().await;
        let active = state.subscriptions_where(|s| {
            s.status == SubscriptionStatus::Active && s.current_period_end > now
        });

        let mut candidates = Vec::new();
        for subscription in active {
            let backed = state.entitlements_where(|e| {
                e.subscription_id == Some(subscription.id)
                    && e.key == EntitlementKey::CanPublishProfile
            });
            let existing = crate::entitlement::most_future_expiring(&backed).cloned();

            let granted = existing.as_ref().is_some_and(|e| e.is_active(now));
            if !granted {
                candidates.push(GrantCandidate {
                    subscription,
                    existing,
                });
            }
        }
        Ok(candidates)
    }

    async fn entitlements_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Entitlement>> {
        self.record_call();
        let state = self.state.lock().await;
        Ok(state.entitlements_where(|e| e.subscription_id == Some(subscription_id)))
    }

    async fn entitlements_for_user(
        &self,
        user_id: Uuid,
        key: EntitlementKey,
    ) -> BillingResult<Vec<Entitlement>> {
        self.record_call();
        let state = self.state.lock().await;
        Ok(state.entitlements_where(|e| e.user_id == user_id && e.key == key))
    }

    async fn apply_expiry(&self, plan: &ExpiryPlan, now: OffsetDateTime) -> BillingResult<()> {
        self.record_call();
        let mut state = self.state.lock().await;

        // Check everything before touching anything
        let sub = state
            .subscriptions
            .get(&plan.subscription_id)
            .ok_or_else(|| BillingError::subscription_conflict(plan.subscription_id))?;
        if sub.status != plan.expected_status || sub.version != plan.expected_version {
            return Err(BillingError::subscription_conflict(plan.subscription_id));
        }
        for revocation in &plan.revocations {
            let current = state
                .entitlements
                .get(&revocation.entitlement_id)
                .map(|e| e.version);
            if current != Some(revocation.expected_version) {
                return Err(BillingError::entitlement_conflict(revocation.entitlement_id));
            }
        }

        if let Some(sub) = state.subscriptions.get_mut(&plan.subscription_id) {
            sub.status = SubscriptionStatus::Expired;
            sub.version += 1;
            sub.updated_at = now;
        }
        for revocation in &plan.revocations {
            if let Some(row) = state.entitlements.get_mut(&revocation.entitlement_id) {
                row.expires_at = Some(now);
                row.version += 1;
                row.updated_at = now;
            }
        }
        drop(state);

        self.record_write();
        Ok(())
    }

    async fn apply_publish_grant(
        &self,
        grant: &PublishGrant,
        now: OffsetDateTime,
    ) -> BillingResult<Entitlement> {
        self.record_call();
        let mut state = self.state.lock().await;

        let still_active = state
            .subscriptions
            .get(&grant.subscription_id)
            .is_some_and(|s| {
                s.status == SubscriptionStatus::Active && s.version == grant.subscription_version
            });
        if !still_active {
            return Err(BillingError::subscription_conflict(grant.subscription_id));
        }

        let row = match grant.existing {
            Some((id, expected_version)) => {
                let row = state
                    .entitlements
                    .get_mut(&id)
                    .filter(|e| e.version == expected_version)
                    .ok_or_else(|| BillingError::entitlement_conflict(id))?;
                row.expires_at = None;
                row.version += 1;
                row.updated_at = now;
                row.clone()
            }
            None => {
                let row = Entitlement::new(
                    grant.user_id,
                    EntitlementKey::CanPublishProfile,
                    None,
                    None,
                    Some(grant.subscription_id),
                    now,
                );
                state.entitlements.insert(row.id, row.clone());
                row
            }
        };
        drop(state);

        self.record_write();
        Ok(row)
    }

    async fn decrement_credit(
        &self,
        entitlement_id: Uuid,
        expected_version: i64,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Entitlement>> {
        self.record_call();
        let mut state = self.state.lock().await;
        let row = state
            .entitlements
            .get_mut(&entitlement_id)
            .ok_or(BillingError::EntitlementNotFound(entitlement_id))?;

        match row.remaining_credits {
            Some(credits) if credits > 0 && row.version == expected_version => {
                row.remaining_credits = Some(credits - 1);
                row.version += 1;
                row.updated_at = now;
                let updated = row.clone();
                drop(state);
                self.record_write();
                Ok(Some(updated))
            }
            _ => Ok(None),
        }
    }

    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        self.record_call();
        Ok(self.state.lock().await.profiles.get(&user_id).cloned())
    }

    async fn list_public_profiles(&self) -> BillingResult<Vec<Profile>> {
        self.record_call();
        let state = self.state.lock().await;
        let mut profiles: Vec<Profile> = state
            .profiles
            .values()
            .filter(|p| p.visibility == ProfileVisibility::Public)
            .cloned()
            .collect();
        profiles.sort_by_key(|p| p.user_id);
        Ok(profiles)
    }

    async fn unpublish_profile(&self, user_id: Uuid, now: OffsetDateTime) -> BillingResult<bool> {
        self.record_call();
        let mut state = self.state.lock().await;
        let Some(profile) = state
            .profiles
            .get_mut(&user_id)
            .filter(|p| p.visibility == ProfileVisibility::Public)
        else {
            return Ok(false);
        };

        profile.visibility = ProfileVisibility::Private;
        profile.published_at = None;
        profile.updated_at = now;
        drop(state);

        self.record_write();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Revocation;
    use time::macros::datetime;
    use time::Duration;

    #[tokio::test]
    async fn test_stale_expiry_plan_changes_nothing() {
        let store = MemoryBillingStore::new();
        let now = datetime!(2026-03-01 12:00 UTC);
        let user_id = Uuid::new_v4();
        let sub = Subscription::new(user_id, "price", now - Duration::days(1), now);
        let grant = Entitlement::new(
            user_id,
            EntitlementKey::CanPublishProfile,
            Some(now + Duration::days(1)),
            None,
            Some(sub.id),
            now,
        );
        store.insert_subscription(sub.clone()).await;
        store.insert_entitlement(grant.clone()).await;

        // Entitlement version no longer matches what the plan was computed from
        let plan = ExpiryPlan {
            subscription_id: sub.id,
            user_id,
            expected_status: SubscriptionStatus::Active,
            expected_version: sub.version,
            revocations: vec![Revocation {
                entitlement_id: grant.id,
                key: EntitlementKey::CanPublishProfile,
                expected_version: grant.version + 1,
            }],
        };

        let err = store.apply_expiry(&plan, now).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            store.subscription(sub.id).await.unwrap().status,
            SubscriptionStatus::Active
        );
        assert_eq!(store.entitlement(grant.id).await.unwrap(), grant);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_decrement_requires_matching_version() {
        let store = MemoryBillingStore::new();
        let now = datetime!(2026-03-01 12:00 UTC);
        let row = Entitlement::new(
            Uuid::new_v4(),
            EntitlementKey::JobPostCredit,
            None,
            Some(2),
            None,
            now,
        );
        store.insert_entitlement(row.clone()).await;

        let updated = store.decrement_credit(row.id, 0, now).await.unwrap().unwrap();
        assert_eq!(updated.remaining_credits, Some(1));
        assert!(store.decrement_credit(row.id, 0, now).await.unwrap().is_none());

        let missing = store.decrement_credit(Uuid::new_v4(), 0, now).await;
        assert!(matches!(missing, Err(BillingError::EntitlementNotFound(_))));
    }
}
