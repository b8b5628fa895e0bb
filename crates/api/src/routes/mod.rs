//! HTTP routes

mod billing;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use billing::{
    CancelAtPeriodEndRequest, EnforceProfileRequest, EnforceProfileResponse, SubscriptionResponse,
};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let billing_routes = Router::new()
        .route("/sync", post(billing::trigger_sync))
        .route(
            "/subscription/cancel-at-period-end",
            post(billing::set_cancel_at_period_end),
        )
        .route("/profile/enforce", post(billing::enforce_profile))
        .route("/invariants", get(billing::run_invariants));

    let job_routes = Router::new().route("/credits/consume", post(billing::consume_job_credit));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/billing", billing_routes)
        .nest("/api/v1/jobs", job_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") }))
}
