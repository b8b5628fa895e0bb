// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Stagehand Background Worker
//!
//! Handles scheduled jobs:
//! - Subscription reconciliation (every 15 minutes by default)
//! - Billing invariant checks (daily at 03:30 UTC by default)
//! - Heartbeat (every 5 minutes)

mod config;

use stagehand_billing::{BillingService, InvariantCheckSummary, SyncSummary, ViolationSeverity};
use stagehand_shared::{create_pool, SystemClock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;

fn log_sync_summary(summary: &SyncSummary) {
    if summary.is_empty() {
        info!(
            users_checked = summary.users_checked,
            "Scheduled reconciliation found nothing to change"
        );
        return;
    }

    info!(
        users_checked = summary.users_checked,
        expired_marked = summary.expired_marked,
        entitlements_granted = summary.entitlements_granted,
        entitlements_revoked = summary.entitlements_revoked,
        profiles_unpublished = summary.profiles_unpublished,
        "Scheduled reconciliation complete"
    );
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "All billing invariants hold");
        return;
    }

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                "{}",
                violation.description
            ),
        }
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant check found violations"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Stagehand Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;

    let billing = BillingService::postgres(pool, SystemClock::shared(), config.reconciler.clone());

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire lapsed subscriptions and reconcile grants
    let reconciler = billing.reconciler.clone();
    scheduler
        .add(Job::new_async(config.reconcile_cron.as_str(), move |_uuid, _l| {
            let reconciler = reconciler.clone();
            Box::pin(async move {
                info!("Running scheduled subscription reconciliation");
                match reconciler.sync_all_subscriptions().await {
                    Ok(summary) => log_sync_summary(&summary),
                    Err(e) => error!(error = %e, "Scheduled reconciliation failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.reconcile_cron, "Scheduled: Subscription reconciliation");

    // Job 2: Invariant checks for alerting
    let invariants = billing.invariants.clone();
    scheduler
        .add(Job::new_async(config.invariant_cron.as_str(), move |_uuid, _l| {
            let invariants = invariants.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.invariant_cron, "Scheduled: Billing invariant checks");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Stagehand Worker started with 3 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}
