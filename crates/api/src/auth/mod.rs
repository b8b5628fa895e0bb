//! Request authentication for the billing endpoints
//!
//! Two callers reach this service: the scheduler/webhook side, which proves
//! itself with the shared `x-cron-secret`, and end users, whose identity the
//! upstream gateway has already verified and forwards as `x-user-id`.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Compare the presented secret without leaking where it differs
pub fn secret_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Caller presented the shared trigger secret
#[derive(Debug, Clone, Copy)]
pub struct CronAuth;

impl<S> FromRequestParts<S> for CronAuth
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);

        match header_str(&parts.headers, CRON_SECRET_HEADER) {
            Some(presented) if secret_matches(presented, &app_state.cron_secret) => Ok(CronAuth),
            presented => {
                tracing::warn!(
                    path = %parts.uri.path(),
                    header_present = presented.is_some(),
                    "Rejected request with missing or wrong cron secret"
                );
                Err(ApiError::Unauthorized)
            }
        }
    }
}

/// End user forwarded by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub Uuid);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = header_str(&parts.headers, USER_ID_HEADER).ok_or(ApiError::Unauthorized)?;
        let id = Uuid::parse_str(raw.trim())
            .map_err(|_| ApiError::BadRequest(format!("{USER_ID_HEADER} is not a valid UUID")))?;
        Ok(UserId(id))
    }
}
