//! Subscription/entitlement reconciliation
//!
//! Brings entitlements and profile visibility back in line with subscription
//! status. One pass has three phases:
//!
//! 1. **Expiry**: every active or canceled subscription whose period has
//!    ended is marked expired and its publish grants are revoked, each
//!    subscription in its own transaction. Users who lose publish rights have
//!    their profile forced private.
//! 2. **Grant**: every active subscription with a running period but no
//!    active publish grant backed by it (new, or reactivated after a lapse)
//!    gets an open-ended grant created or restored.
//! 3. **Sweep**: every public profile whose user has no active publish
//!    grant is forced private. This catches cascades that failed after their
//!    expiry committed.
//!
//! A failure on one subscription is logged and skipped, so the summary is a
//! lower bound. Running a pass twice in a row yields an all-zero summary the
//! second time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagehand_shared::{env_duration_secs, env_flag, ConfigError, EntitlementKey, SharedClock};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::profile::ProfileVisibilityService;
use crate::store::{BillingStore, ExpiryPlan, GrantCandidate, PublishGrant, Revocation};
use crate::subscriptions::Subscription;

/// Default upper bound for processing a single subscription
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconciliation policy
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Also expire job post credits backed by a lapsed subscription.
    ///
    /// Off by default: credits already bought stay usable until their own
    /// expiry, and revocation is never subtractive.
    pub expire_credits_with_subscription: bool,
    /// Per-subscription deadline; an item over it is skipped
    pub item_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            expire_credits_with_subscription: false,
            item_timeout: DEFAULT_ITEM_TIMEOUT,
        }
    }
}

impl ReconcilerConfig {
    /// Read `EXPIRE_CREDITS_WITH_SUBSCRIPTION` and `SYNC_ITEM_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let item_timeout =
            env_duration_secs("SYNC_ITEM_TIMEOUT_SECS", DEFAULT_ITEM_TIMEOUT.as_secs())?;
        Ok(Self {
            expire_credits_with_subscription: env_flag("EXPIRE_CREDITS_WITH_SUBSCRIPTION", false)?,
            item_timeout,
        })
    }
}

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub users_checked: u64,
    pub expired_marked: u64,
    pub entitlements_granted: u64,
    pub entitlements_revoked: u64,
    pub profiles_unpublished: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limited: Option<bool>,
}

impl SyncSummary {
    /// Zeroed summary returned when a trigger is inside the minimum interval
    pub fn rate_limited() -> Self {
        Self {
            rate_limited: Some(true),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.expired_marked == 0
            && self.entitlements_granted == 0
            && self.entitlements_revoked == 0
            && self.profiles_unpublished == 0
    }
}

/// Result of expiring one subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ExpiryOutcome {
    revoked: u64,
    revokes_publish: bool,
}

/// Work out what expiring `subscription` has to write
///
/// Publish grants backed by the subscription that are still active get
/// revoked. Job post credits are only revoked when `expire_credits` is set.
pub fn plan_expiry(
    subscription: &Subscription,
    backed: &[Entitlement],
    now: OffsetDateTime,
    expire_credits: bool,
) -> ExpiryPlan {
    let revocations = backed
        .iter()
        .filter(|e| e.subscription_id == Some(subscription.id) && e.is_active(now))
        .filter(|e| match e.key {
            EntitlementKey::CanPublishProfile => true,
            EntitlementKey::JobPostCredit => expire_credits,
        })
        .map(|e| Revocation {
            entitlement_id: e.id,
            key: e.key,
            expected_version: e.version,
        })
        .collect();

    ExpiryPlan {
        subscription_id: subscription.id,
        user_id: subscription.user_id,
        expected_status: subscription.status,
        expected_version: subscription.version,
        revocations,
    }
}

/// Publish grant restoring publish rights for `candidate`
pub fn plan_grant(candidate: &GrantCandidate) -> PublishGrant {
    let subscription = &candidate.subscription;
    PublishGrant {
        subscription_id: subscription.id,
        subscription_version: subscription.version,
        user_id: subscription.user_id,
        existing: candidate.existing.as_ref().map(|e| (e.id, e.version)),
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn BillingStore>,
    clock: SharedClock,
    profiles: ProfileVisibilityService,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn BillingStore>, clock: SharedClock, config: ReconcilerConfig) -> Self {
        let profiles = ProfileVisibilityService::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            profiles,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one full reconciliation pass
    ///
    /// Only listing the candidates can fail the pass; per-subscription errors
    /// are logged and skipped.
    pub async fn sync_all_subscriptions(&self) -> BillingResult<SyncSummary> {
        let now = self.clock.now();
        let mut summary = SyncSummary::default();
        let mut users: HashSet<Uuid> = HashSet::new();
        let mut failures = 0u64;

        let due = self.store.list_due_subscriptions(now).await?;
        tracing::debug!(count = due.len(), "Subscriptions due for expiry");

        for subscription in &due {
            users.insert(subscription.user_id);

            let result =
                tokio::time::timeout(self.config.item_timeout, self.expire_one(subscription, now))
                    .await
                    .unwrap_or_else(|_| {
                        Err(BillingError::Timeout(format!(
                            "expiring subscription {}",
                            subscription.id
                        )))
                    });

            match result {
                Ok(outcome) => {
                    summary.expired_marked += 1;
                    summary.entitlements_revoked += outcome.revoked;
                    if outcome.revokes_publish && self.cascade(subscription.user_id).await {
                        summary.profiles_unpublished += 1;
                    }
                }
                Err(e) => {
                    failures += 1;
                    log_item_failure(subscription, "expire", &e);
                }
            }
        }

        let candidates = self.store.list_grant_candidates(now).await?;
        tracing::debug!(count = candidates.len(), "Subscriptions needing a publish grant");

        for candidate in &candidates {
            let subscription = &candidate.subscription;
            users.insert(subscription.user_id);

            let grant = plan_grant(candidate);
            let result = tokio::time::timeout(
                self.config.item_timeout,
                self.store.apply_publish_grant(&grant, now),
            )
            .await
            .unwrap_or_else(|_| {
                Err(BillingError::Timeout(format!(
                    "granting subscription {}",
                    subscription.id
                )))
            });

            match result {
                Ok(row) => {
                    summary.entitlements_granted += 1;
                    tracing::info!(
                        user_id = %subscription.user_id,
                        subscription_id = %subscription.id,
                        entitlement_id = %row.id,
                        restored = grant.existing.is_some(),
                        "Granted publish entitlement for active subscription"
                    );
                }
                Err(e) => {
                    failures += 1;
                    log_item_failure(subscription, "grant", &e);
                }
            }
        }

        let public = self.store.list_public_profiles().await?;
        tracing::debug!(count = public.len(), "Public profiles to sweep");

        for profile in &public {
            let result = tokio::time::timeout(
                self.config.item_timeout,
                self.profiles.auto_unpublish_if_no_entitlement(profile.user_id),
            )
            .await
            .unwrap_or_else(|_| {
                Err(BillingError::Timeout(format!(
                    "sweeping profile {}",
                    profile.user_id
                )))
            });

            match result {
                Ok(true) => {
                    users.insert(profile.user_id);
                    summary.profiles_unpublished += 1;
                    tracing::warn!(
                        user_id = %profile.user_id,
                        "Swept public profile without publish entitlement"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    failures += 1;
                    tracing::error!(
                        user_id = %profile.user_id,
                        phase = "sweep",
                        error = %e,
                        "Failed to enforce profile visibility"
                    );
                }
            }
        }

        summary.users_checked = users.len() as u64;

        tracing::info!(
            users_checked = summary.users_checked,
            expired_marked = summary.expired_marked,
            entitlements_granted = summary.entitlements_granted,
            entitlements_revoked = summary.entitlements_revoked,
            profiles_unpublished = summary.profiles_unpublished,
            failures = failures,
            "Subscription reconciliation complete"
        );

        Ok(summary)
    }

    /// On-demand enforcement for a single user (webhook path)
    pub async fn enforce_profile(&self, user_id: Uuid) -> BillingResult<bool> {
        self.profiles.auto_unpublish_if_no_entitlement(user_id).await
    }

    async fn expire_one(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<ExpiryOutcome> {
        let backed = self
            .store
            .entitlements_for_subscription(subscription.id)
            .await?;
        let plan = plan_expiry(
            subscription,
            &backed,
            now,
            self.config.expire_credits_with_subscription,
        );

        self.store.apply_expiry(&plan, now).await?;

        tracing::info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            previous_status = %subscription.status,
            period_end = %subscription.current_period_end,
            cancel_at_period_end = subscription.cancel_at_period_end,
            revoked = plan.revocations.len(),
            "Subscription expired"
        );

        Ok(ExpiryOutcome {
            revoked: plan.revocations.len() as u64,
            revokes_publish: plan.revokes_publish(),
        })
    }

    /// Cascade after a committed expiry; failures are left to the sweep phase
    async fn cascade(&self, user_id: Uuid) -> bool {
        let result = tokio::time::timeout(
            self.config.item_timeout,
            self.profiles.auto_unpublish_if_no_entitlement(user_id),
        )
        .await
        .unwrap_or_else(|_| {
            Err(BillingError::Timeout(format!(
                "unpublishing profile {user_id}"
            )))
        });

        match result {
            Ok(changed) => changed,
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    error = %e,
                    "Failed to unpublish profile after entitlement revocation"
                );
                false
            }
        }
    }
}

fn log_item_failure(subscription: &Subscription, phase: &'static str, error: &BillingError) {
    if error.is_retryable() {
        tracing::info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            phase,
            error = %error,
            "Subscription changed concurrently, skipping"
        );
    } else {
        tracing::error!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            phase,
            error = %error,
            "Failed to reconcile subscription"
        );
    }
}
