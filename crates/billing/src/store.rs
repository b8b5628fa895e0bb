//! Billing persistence
//!
//! [`BillingStore`] is the seam between the billing services and storage.
//! Reads are plain; every write is conditional on the `version` (and, for
//! subscriptions, the status) the caller read earlier, and reports a
//! [`BillingError::ConcurrencyConflict`](crate::BillingError) when the row
//! moved underneath it.

use async_trait::async_trait;
use stagehand_shared::{EntitlementKey, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::Entitlement;
use crate::error::BillingResult;
use crate::profile::Profile;
use crate::subscriptions::Subscription;

/// Entitlement to revoke as part of an expiry, with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revocation {
    pub entitlement_id: Uuid,
    pub key: EntitlementKey,
    pub expected_version: i64,
}

/// Everything one subscription expiry writes, applied atomically
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryPlan {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub expected_status: SubscriptionStatus,
    pub expected_version: i64,
    pub revocations: Vec<Revocation>,
}

impl ExpiryPlan {
    /// Whether applying this plan takes away publish rights
    pub fn revokes_publish(&self) -> bool {
        self.revocations
            .iter()
            .any(|r| r.key == EntitlementKey::CanPublishProfile)
    }
}

/// Active subscription without an active publish grant backed by it
#[derive(Debug, Clone)]
pub struct GrantCandidate {
    pub subscription: Subscription,
    pub existing: Option<Entitlement>,
}

/// Open-ended publish grant to create or restore for an active subscription
///
/// Subscription-backed grants carry no expiry of their own; they last until
/// the reconciler revokes them when the subscription lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishGrant {
    pub subscription_id: Uuid,
    pub subscription_version: i64,
    pub user_id: Uuid,
    /// `(entitlement id, version)` of the revoked row to restore; insert when `None`
    pub existing: Option<(Uuid, i64)>,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Most recently created subscription of a user
    async fn latest_subscription_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    /// Flip the cancel flag on the user's most recent subscription; `None` if there is none
    async fn set_cancel_at_period_end(
        &self,
        user_id: Uuid,
        cancel_at_period_end: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>>;

    /// Active or canceled subscriptions whose period ended at or before `now`
    async fn list_due_subscriptions(&self, now: OffsetDateTime)
        -> BillingResult<Vec<Subscription>>;

    /// Active or canceled subscriptions whose period is still running
    async fn list_live_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;

    /// Active subscriptions with a running period and no active publish grant backed by them
    async fn list_grant_candidates(&self, now: OffsetDateTime)
        -> BillingResult<Vec<GrantCandidate>>;

    async fn entitlements_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Entitlement>>;

    async fn entitlements_for_user(
        &self,
        user_id: Uuid,
        key: EntitlementKey,
    ) -> BillingResult<Vec<Entitlement>>;

    /// Mark the subscription expired and revoke the planned entitlements in one transaction
    async fn apply_expiry(&self, plan: &ExpiryPlan, now: OffsetDateTime) -> BillingResult<()>;

    /// Insert or restore a publish grant, re-checking the backing subscription
    async fn apply_publish_grant(
        &self,
        grant: &PublishGrant,
        now: OffsetDateTime,
    ) -> BillingResult<Entitlement>;

    /// Take one credit if the row is still at `expected_version` and has credits left
    async fn decrement_credit(
        &self,
        entitlement_id: Uuid,
        expected_version: i64,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Entitlement>>;

    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>>;

    async fn list_public_profiles(&self) -> BillingResult<Vec<Profile>>;

    /// Force a public profile private and clear its publish time; false if it was not public
    async fn unpublish_profile(&self, user_id: Uuid, now: OffsetDateTime) -> BillingResult<bool>;
}
