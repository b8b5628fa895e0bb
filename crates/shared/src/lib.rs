// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Stagehand Shared
//!
//! Pieces every Stagehand crate needs: the injected time source, the
//! billing domain enums stored as text columns, environment parsing, and
//! Postgres pool setup.

pub mod clock;
pub mod config;
pub mod db;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{env_duration_secs, env_flag, ConfigError};
pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{EntitlementKey, ParseEnumError, ProfileVisibility, SubscriptionStatus};
