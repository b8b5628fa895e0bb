// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Stagehand Billing API Library
//!
//! HTTP surface for entitlement reconciliation: the scheduler trigger,
//! user-facing subscription and job credit endpoints, and operator checks.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, ConfigError, StoreBackend};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
