//! Configuration for the API server.

use std::net::SocketAddr;
use std::time::Duration;

use stagehand_billing::{ReconcilerConfig, DEFAULT_MIN_INTERVAL};
pub use stagehand_shared::ConfigError;
use stagehand_shared::{env_duration_secs, env_flag};

/// Where billing state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local, for local runs and demos
    Memory,
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to
    pub bind_address: SocketAddr,
    /// Database URL; required for the Postgres backend
    pub database_url: Option<String>,
    pub store_backend: StoreBackend,
    /// Apply pending migrations at startup
    pub run_migrations: bool,
    /// Shared secret expected in `x-cron-secret`
    pub cron_secret: String,
    /// Minimum time between two triggered reconciliation passes
    pub sync_min_interval: Duration,
    pub reconciler: ReconcilerConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address = std::env::var("BIND_ADDRESS")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("BIND_ADDRESS"))?;

        let store_backend = match std::env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            _ => return Err(ConfigError::Invalid("STORE_BACKEND")),
        };

        let database_url = std::env::var("DATABASE_URL").ok();
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let cron_secret = std::env::var("CRON_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("CRON_SECRET"))?;

        let sync_min_interval =
            env_duration_secs("SYNC_MIN_INTERVAL_SECS", DEFAULT_MIN_INTERVAL.as_secs())?;

        Ok(Self {
            bind_address,
            database_url,
            store_backend,
            run_migrations: env_flag("RUN_MIGRATIONS", false)?,
            cron_secret,
            sync_min_interval,
            reconciler: ReconcilerConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "BIND_ADDRESS",
        "STORE_BACKEND",
        "DATABASE_URL",
        "CRON_SECRET",
        "SYNC_MIN_INTERVAL_SECS",
        "SYNC_ITEM_TIMEOUT_SECS",
        "EXPIRE_CREDITS_WITH_SUBSCRIPTION",
        "RUN_MIGRATIONS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_with_memory_backend() {
        clear_env();
        std::env::set_var("STORE_BACKEND", "memory");
        std::env::set_var("CRON_SECRET", "s3cret");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address.to_string(), "0.0.0.0:8080");
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.sync_min_interval, Duration::from_secs(60));
        assert_eq!(config.reconciler.item_timeout, Duration::from_secs(10));
        assert!(!config.reconciler.expire_credits_with_subscription);
        assert!(!config.run_migrations);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_postgres_requires_database_url() {
        clear_env();
        std::env::set_var("CRON_SECRET", "s3cret");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_or_empty_cron_secret() {
        clear_env();
        std::env::set_var("STORE_BACKEND", "memory");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Missing("CRON_SECRET")
        ));

        std::env::set_var("CRON_SECRET", "");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Missing("CRON_SECRET")
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_overrides_and_invalid_values() {
        clear_env();
        std::env::set_var("STORE_BACKEND", "memory");
        std::env::set_var("CRON_SECRET", "s3cret");
        std::env::set_var("SYNC_MIN_INTERVAL_SECS", "120");
        std::env::set_var("EXPIRE_CREDITS_WITH_SUBSCRIPTION", "true");

        let config = Config::from_env().unwrap();
        assert_eq!(config.sync_min_interval, Duration::from_secs(120));
        assert!(config.reconciler.expire_credits_with_subscription);

        std::env::set_var("SYNC_ITEM_TIMEOUT_SECS", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("SYNC_ITEM_TIMEOUT_SECS")
        ));

        std::env::set_var("SYNC_ITEM_TIMEOUT_SECS", "5");
        std::env::set_var("STORE_BACKEND", "redis");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("STORE_BACKEND")
        ));
        clear_env();
    }
}
