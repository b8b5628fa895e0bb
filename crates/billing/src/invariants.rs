//! Billing Invariants Module
//!
//! Runnable consistency checks over subscriptions, entitlements and profile
//! visibility. Safe to run at any time: checks only read. A healthy system
//! right after a reconciliation pass reports no violations.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stagehand_shared::{EntitlementKey, SharedClock};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::most_future_expiring;
use crate::error::BillingResult;
use crate::store::BillingStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - users may be charged or entitled twice
    Critical,
    /// High - access does not match what was paid for
    High,
    /// Medium - reconciliation is behind
    Medium,
    /// Low - informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

fn rfc3339(at: OffsetDateTime) -> Option<String> {
    at.format(&Rfc3339).ok()
}

const SINGLE_LIVE_SUBSCRIPTION: &str = "single_live_subscription";
const STALE_ACTIVE_SUBSCRIPTION: &str = "stale_active_subscription";
const PUBLIC_PROFILE_WITHOUT_ENTITLEMENT: &str = "public_profile_without_entitlement";

#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
    clock: SharedClock,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = self.clock.now();
        let mut violations = Vec::new();

        violations.extend(self.check_single_live_subscription(now).await?);
        violations.extend(self.check_no_stale_active_subscription(now).await?);
        violations.extend(self.check_public_profiles_entitled(now).await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most one live subscription per user
    ///
    /// Two running subscriptions means the user is paying twice.
    async fn check_single_live_subscription(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let live = self.store.list_live_subscriptions(now).await?;

        let mut per_user: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for sub in &live {
            per_user.entry(sub.user_id).or_default().push(sub.id);
        }

        let mut violations: Vec<InvariantViolation> = per_user
            .into_iter()
            .filter(|(_, subs)| subs.len() > 1)
            .map(|(user_id, subs)| InvariantViolation {
                invariant: SINGLE_LIVE_SUBSCRIPTION.to_string(),
                user_ids: vec![user_id],
                description: format!("User has {} live subscriptions (expected 1)", subs.len()),
                context: serde_json::json!({ "subscription_ids": subs }),
                severity: ViolationSeverity::Critical,
            })
            .collect();
        violations.sort_by_key(|v| v.user_ids.first().copied());
        Ok(violations)
    }

    /// Invariant 2: No active or canceled subscription past its period end
    ///
    /// These are exactly the rows the next reconciliation pass will expire.
    async fn check_no_stale_active_subscription(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let due = self.store.list_due_subscriptions(now).await?;

        Ok(due
            .into_iter()
            .map(|sub| InvariantViolation {
                invariant: STALE_ACTIVE_SUBSCRIPTION.to_string(),
                user_ids: vec![sub.user_id],
                description: format!(
                    "Subscription is still {} after its period ended at {}",
                    sub.status, sub.current_period_end
                ),
                context: serde_json::json!({
                    "subscription_id": sub.id,
                    "status": sub.status,
                    "current_period_end": rfc3339(sub.current_period_end),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 3: Public profiles have an active publish entitlement
    async fn check_public_profiles_entitled(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let profiles = self.store.list_public_profiles().await?;
        let mut violations = Vec::new();

        for profile in profiles {
            let rows = self
                .store
                .entitlements_for_user(profile.user_id, EntitlementKey::CanPublishProfile)
                .await?;
            let latest = most_future_expiring(&rows);
            if latest.is_some_and(|e| e.is_active(now)) {
                continue;
            }

            violations.push(InvariantViolation {
                invariant: PUBLIC_PROFILE_WITHOUT_ENTITLEMENT.to_string(),
                user_ids: vec![profile.user_id],
                description: "Profile is public without an active publish entitlement".to_string(),
                context: serde_json::json!({
                    "published_at": profile.published_at.and_then(rfc3339),
                    "latest_expiry": latest.and_then(|e| e.expires_at).and_then(rfc3339),
                }),
                severity: ViolationSeverity::High,
            });
        }

        Ok(violations)
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let now = self.clock.now();
        match name {
            SINGLE_LIVE_SUBSCRIPTION => self.check_single_live_subscription(now).await,
            STALE_ACTIVE_SUBSCRIPTION => self.check_no_stale_active_subscription(now).await,
            PUBLIC_PROFILE_WITHOUT_ENTITLEMENT => self.check_public_profiles_entitled(now).await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            SINGLE_LIVE_SUBSCRIPTION,
            STALE_ACTIVE_SUBSCRIPTION,
            PUBLIC_PROFILE_WITHOUT_ENTITLEMENT,
        ]
    }
}
