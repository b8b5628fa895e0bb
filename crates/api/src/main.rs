//! Stagehand Billing API Server
//!
//! Serves the reconciliation trigger and the entitlement endpoints.

use std::sync::Arc;

use anyhow::Context;
use stagehand_api::{create_router, AppState, Config, StoreBackend};
use stagehand_billing::{BillingService, MemoryBillingStore, SyncTriggerGuard};
use stagehand_shared::{create_migration_pool, create_pool, run_migrations, SystemClock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stagehand_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Stagehand billing API v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(
        store_backend = ?config.store_backend,
        sync_min_interval_secs = config.sync_min_interval.as_secs(),
        expire_credits_with_subscription = config.reconciler.expire_credits_with_subscription,
        "Configuration loaded"
    );

    let clock = SystemClock::shared();

    let billing = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;

            if config.run_migrations {
                tracing::info!("Running database migrations...");
                let migration_pool = create_migration_pool(database_url).await?;
                run_migrations(&migration_pool).await?;
                migration_pool.close().await;
                tracing::info!("Database migrations complete");
            }

            tracing::info!("Connecting to database...");
            let pool = create_pool(database_url).await?;
            tracing::info!("Database connection established");

            BillingService::postgres(pool, clock.clone(), config.reconciler.clone())
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory billing store; state is lost on restart");
            BillingService::new(
                Arc::new(MemoryBillingStore::new()),
                clock.clone(),
                config.reconciler.clone(),
            )
        }
    };

    let sync_guard = SyncTriggerGuard::new(clock, config.sync_min_interval);
    let state = AppState::new(billing, sync_guard, &config.cron_secret);
    let app = create_router(state);

    tracing::info!("Listening on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
