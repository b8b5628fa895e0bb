// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries owned context strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Stagehand Billing Module
//!
//! Keeps what a user may do in line with what they pay for.
//!
//! ## Features
//!
//! - **Subscriptions**: Read a user's plan and toggle cancel-at-period-end
//! - **Reconciliation**: Expire lapsed subscriptions and revoke the grants they back
//! - **Profile Visibility**: Force profiles private once publish rights are gone
//! - **Job Post Credits**: Race-safe credit consumption with a bounded retry
//! - **Sync Rate Limiting**: Minimum interval between externally triggered passes
//! - **Invariants**: Runnable consistency checks for alerting

pub mod credits;
pub mod entitlement;
pub mod error;
pub mod invariants;
pub mod memory_store;
pub mod pg_store;
pub mod profile;
pub mod rate_limit;
pub mod reconcile;
pub mod store;
pub mod subscriptions;


use std::sync::Arc;

use sqlx::PgPool;
use stagehand_shared::SharedClock;

// Credits
pub use credits::{select_credit_row, CreditRef, JobCreditService};

// Entitlement
pub use entitlement::{most_future_expiring, Entitlement, EntitlementState};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Stores
pub use memory_store::MemoryBillingStore;
pub use pg_store::PgBillingStore;
pub use store::{BillingStore, ExpiryPlan, GrantCandidate, PublishGrant, Revocation};

// Profile
pub use profile::{Profile, ProfileVisibilityService};

// Rate Limit
pub use rate_limit::{SyncTriggerGuard, TriggerDecision, DEFAULT_MIN_INTERVAL};

// Reconciliation
pub use reconcile::{
    plan_expiry, plan_grant, Reconciler, ReconcilerConfig, SyncSummary, DEFAULT_ITEM_TIMEOUT,
};

// Subscriptions
pub use subscriptions::{Subscription, SubscriptionService};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub credits: JobCreditService,
    pub profiles: ProfileVisibilityService,
    pub reconciler: Reconciler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a billing service over any store
    pub fn new(store: Arc<dyn BillingStore>, clock: SharedClock, config: ReconcilerConfig) -> Self {
        Self {
            subscriptions: SubscriptionService::new(store.clone(), clock.clone()),
            credits: JobCreditService::new(store.clone(), clock.clone()),
            profiles: ProfileVisibilityService::new(store.clone(), clock.clone()),
            reconciler: Reconciler::new(store.clone(), clock.clone(), config),
            invariants: InvariantChecker::new(store, clock),
        }
    }

    /// Create a billing service backed by PostgreSQL
    pub fn postgres(pool: PgPool, clock: SharedClock, config: ReconcilerConfig) -> Self {
        Self::new(Arc::new(PgBillingStore::new(pool)), clock, config)
    }
}
