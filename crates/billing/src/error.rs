//! Billing error types

use stagehand_shared::ParseEnumError;
use uuid::Uuid;

/// Errors raised by billing operations
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("No subscription found for user {0}")]
    SubscriptionNotFound(Uuid),

    #[error("Entitlement {0} not found")]
    EntitlementNotFound(Uuid),

    #[error("User has no job post entitlement")]
    NoEntitlement,

    #[error("Job post credits have expired")]
    ExpiredCredits,

    #[error("No job post credits remaining")]
    InsufficientCredits,

    #[error("Concurrent update detected on {resource} {id}")]
    ConcurrencyConflict { resource: &'static str, id: Uuid },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl BillingError {
    pub(crate) fn subscription_conflict(id: Uuid) -> Self {
        BillingError::ConcurrencyConflict {
            resource: "subscription",
            id,
        }
    }

    pub(crate) fn entitlement_conflict(id: Uuid) -> Self {
        BillingError::ConcurrencyConflict {
            resource: "entitlement",
            id,
        }
    }

    /// Only optimistic conflicts are worth retrying; everything else fails the same way twice
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::ConcurrencyConflict { .. })
    }

    /// Stable code clients use to pick a localized message
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            BillingError::EntitlementNotFound(_) => "ENTITLEMENT_NOT_FOUND",
            BillingError::NoEntitlement => "NO_ENTITLEMENT",
            BillingError::ExpiredCredits => "EXPIRED_CREDITS",
            BillingError::InsufficientCredits => "INSUFFICIENT_CREDITS",
            BillingError::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            BillingError::Timeout(_) => "TIMEOUT",
            BillingError::InvalidData(_) | BillingError::Database(_) => "INTERNAL_ERROR",
        }
    }

    /// Default (English) message for the end user
    pub fn user_message(&self) -> &'static str {
        match self {
            BillingError::SubscriptionNotFound(_) => "You don't have a subscription yet.",
            BillingError::NoEntitlement => {
                "Your plan doesn't include job posts. Upgrade to post castings."
            }
            BillingError::ExpiredCredits => {
                "Your job post credits have expired. Renew your plan to post again."
            }
            BillingError::InsufficientCredits => {
                "You've used all your job post credits for this period."
            }
            BillingError::ConcurrencyConflict { .. } => {
                "Your account was updated at the same time. Please try again."
            }
            _ => "Something went wrong. Please try again later.",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<ParseEnumError> for BillingError {
    fn from(e: ParseEnumError) -> Self {
        BillingError::InvalidData(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflicts_are_retryable() {
        let conflict = BillingError::entitlement_conflict(Uuid::new_v4());
        assert!(conflict.is_retryable());
        assert!(!BillingError::InsufficientCredits.is_retryable());
        assert!(!BillingError::ExpiredCredits.is_retryable());
        assert!(!BillingError::NoEntitlement.is_retryable());
        assert!(!BillingError::Database("down".into()).is_retryable());
    }

    #[test]
    fn test_credit_failures_have_stable_codes() {
        assert_eq!(BillingError::InsufficientCredits.code(), "INSUFFICIENT_CREDITS");
        assert_eq!(BillingError::NoEntitlement.code(), "NO_ENTITLEMENT");
        assert_eq!(BillingError::ExpiredCredits.code(), "EXPIRED_CREDITS");
        assert_eq!(
            BillingError::Database("x".into()).user_message(),
            "Something went wrong. Please try again later."
        );
    }

    #[test]
    fn test_parse_error_maps_to_invalid_data() {
        let err: BillingError = "paused"
            .parse::<stagehand_shared::SubscriptionStatus>()
            .unwrap_err()
            .into();
        assert!(matches!(err, BillingError::InvalidData(_)));
    }
}
