//! Billing and entitlement endpoints

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use stagehand_billing::{
    CreditRef, InvariantChecker, InvariantViolation, Subscription, SyncSummary, TriggerDecision,
};
use stagehand_shared::SubscriptionStatus;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::{CronAuth, UserId};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

/// `{ ok: true, ...payload }`
#[derive(Debug, Serialize)]
pub struct Success<T: Serialize> {
    ok: bool,
    #[serde(flatten)]
    payload: T,
}

impl<T: Serialize> Success<T> {
    fn json(payload: T) -> Json<Self> {
        Json(Self { ok: true, payload })
    }
}

// =============================================================================
// Reconciliation trigger
// =============================================================================

/// POST /api/v1/billing/sync
///
/// Runs one reconciliation pass unless another trigger ran within the
/// minimum interval, in which case a zeroed, rate-limited summary is returned.
pub async fn trigger_sync(
    _auth: CronAuth,
    State(state): State<AppState>,
) -> ApiResult<Json<Success<SyncSummary>>> {
    if let TriggerDecision::RateLimited {
        retry_after_seconds,
    } = state.sync_guard.try_acquire().await
    {
        tracing::info!(retry_after_seconds, "Reconciliation trigger rate limited");
        return Ok(Success::json(SyncSummary::rate_limited()));
    }

    let summary = state.billing.reconciler.sync_all_subscriptions().await?;
    Ok(Success::json(summary))
}

// =============================================================================
// Subscription
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAtPeriodEndRequest {
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub price_id: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(sub: Subscription) -> Self {
        Self {
            id: sub.id,
            price_id: sub.price_id,
            status: sub.status,
            current_period_end: sub.current_period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubscriptionEnvelope {
    pub subscription: SubscriptionResponse,
}

/// POST /api/v1/billing/subscription/cancel-at-period-end
pub async fn set_cancel_at_period_end(
    UserId(user_id): UserId,
    State(state): State<AppState>,
    payload: Result<Json<CancelAtPeriodEndRequest>, JsonRejection>,
) -> ApiResult<Json<Success<SubscriptionEnvelope>>> {
    let request = json_body(payload)?;

    let subscription = state
        .billing
        .subscriptions
        .set_cancel_at_period_end(user_id, request.cancel_at_period_end)
        .await?;

    Ok(Success::json(SubscriptionEnvelope {
        subscription: subscription.into(),
    }))
}

// =============================================================================
// Job post credits
// =============================================================================

/// POST /api/v1/jobs/credits/consume
pub async fn consume_job_credit(
    UserId(user_id): UserId,
    State(state): State<AppState>,
) -> ApiResult<Json<Success<CreditRef>>> {
    let credit = state
        .billing
        .credits
        .consume_job_credit_with_retry(user_id)
        .await?;
    Ok(Success::json(credit))
}

// =============================================================================
// Profile enforcement and invariants
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforceProfileRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct EnforceProfileResponse {
    pub changed: bool,
}

/// POST /api/v1/billing/profile/enforce
///
/// Webhook-driven path: re-check one user's publish rights right away
/// instead of waiting for the next pass.
pub async fn enforce_profile(
    _auth: CronAuth,
    State(state): State<AppState>,
    payload: Result<Json<EnforceProfileRequest>, JsonRejection>,
) -> ApiResult<Json<Success<EnforceProfileResponse>>> {
    let request = json_body(payload)?;
    let changed = state.billing.reconciler.enforce_profile(request.user_id).await?;
    Ok(Success::json(EnforceProfileResponse { changed }))
}

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    pub check: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SingleCheckResponse {
    pub check: String,
    pub violations: Vec<InvariantViolation>,
}

/// GET /api/v1/billing/invariants[?check=<name>]
pub async fn run_invariants(
    _auth: CronAuth,
    State(state): State<AppState>,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Response> {
    if let Some(check) = query.check {
        if !InvariantChecker::available_checks().contains(&check.as_str()) {
            return Err(ApiError::BadRequest(format!("Unknown invariant check: {check}")));
        }
        let violations = state.billing.invariants.run_check(&check).await?;
        return Ok(Success::json(SingleCheckResponse { check, violations }).into_response());
    }

    let summary = state.billing.invariants.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Billing invariant violations found"
        );
    }
    Ok(Success::json(summary).into_response())
}
