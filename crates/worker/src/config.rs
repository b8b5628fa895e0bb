//! Worker configuration

use stagehand_billing::ReconcilerConfig;
use stagehand_shared::ConfigError;

/// Every 15 minutes, on the minute
pub const DEFAULT_RECONCILE_CRON: &str = "0 */15 * * * *";
/// Daily at 03:30 UTC
pub const DEFAULT_INVARIANT_CRON: &str = "0 30 3 * * *";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub reconcile_cron: String,
    pub invariant_cron: String,
    pub reconciler: ReconcilerConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            reconcile_cron: std::env::var("RECONCILE_CRON")
                .unwrap_or_else(|_| DEFAULT_RECONCILE_CRON.to_string()),
            invariant_cron: std::env::var("INVARIANT_CRON")
                .unwrap_or_else(|_| DEFAULT_INVARIANT_CRON.to_string()),
            reconciler: ReconcilerConfig::from_env()?,
        })
    }
}
