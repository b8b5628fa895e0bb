//! Application state

use std::sync::Arc;

use stagehand_billing::{BillingService, SyncTriggerGuard};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: BillingService,
    /// Guards the reconciliation trigger; one per process
    pub sync_guard: Arc<SyncTriggerGuard>,
    pub cron_secret: Arc<str>,
}

impl AppState {
    pub fn new(billing: BillingService, sync_guard: SyncTriggerGuard, cron_secret: &str) -> Self {
        Self {
            billing,
            sync_guard: Arc::new(sync_guard),
            cron_secret: Arc::from(cron_secret),
        }
    }
}
