//! API error type and its JSON rendering
//!
//! Every failure renders as `{ "ok": false, "error": { "code", "message" } }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use stagehand_billing::BillingError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Billing(e) => match e {
                BillingError::SubscriptionNotFound(_) | BillingError::EntitlementNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                BillingError::NoEntitlement => StatusCode::FORBIDDEN,
                BillingError::ExpiredCredits | BillingError::InsufficientCredits => {
                    StatusCode::PAYMENT_REQUIRED
                }
                BillingError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
                BillingError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                BillingError::InvalidData(_) | BillingError::Database(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Billing(e) => e.code(),
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Unauthorized => "Missing or invalid credentials".to_string(),
            Self::BadRequest(reason) => reason.clone(),
            Self::Billing(e) => e.user_message().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "Internal API error");
        }

        let body = ErrorBody {
            ok: false,
            error: ErrorDetail {
                code: self.error_code(),
                message: self.message(),
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_billing_errors_map_to_statuses() {
        let cases = [
            (BillingError::SubscriptionNotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (BillingError::NoEntitlement, StatusCode::FORBIDDEN),
            (BillingError::ExpiredCredits, StatusCode::PAYMENT_REQUIRED),
            (BillingError::InsufficientCredits, StatusCode::PAYMENT_REQUIRED),
            (
                BillingError::ConcurrencyConflict {
                    resource: "entitlement",
                    id: Uuid::nil(),
                },
                StatusCode::CONFLICT,
            ),
            (
                BillingError::Database("pool timed out".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status_code(), status);
        }
    }

    #[test]
    fn test_internal_details_not_exposed() {
        let err = ApiError::from(BillingError::Database("password=hunter2".to_string()));
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
        assert!(!err.message().contains("hunter2"));
    }
}
