//! Billing domain enums
//!
//! Stored as lowercase text in Postgres and serialized the same way over
//! JSON.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Failed to parse a stored enum value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle of a subscription row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Paid and renewing
    Active,
    /// Canceled, but the paid period is still running
    Canceled,
    /// Period ended without renewal
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Still backing entitlements until its period end
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Canceled)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(ParseEnumError {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

/// Capability name of an entitlement row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementKey {
    CanPublishProfile,
    JobPostCredit,
}

impl EntitlementKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementKey::CanPublishProfile => "can_publish_profile",
            EntitlementKey::JobPostCredit => "job_post_credit",
        }
    }
}

impl fmt::Display for EntitlementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitlementKey {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "can_publish_profile" => Ok(EntitlementKey::CanPublishProfile),
            "job_post_credit" => Ok(EntitlementKey::JobPostCredit),
            other => Err(ParseEnumError {
                kind: "entitlement key",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether a talent profile is listed publicly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileVisibility {
    Public,
    Private,
}

impl ProfileVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileVisibility::Public => "public",
            ProfileVisibility::Private => "private",
        }
    }
}

impl fmt::Display for ProfileVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileVisibility {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(ProfileVisibility::Public),
            "private" => Ok(ProfileVisibility::Private),
            other => Err(ParseEnumError {
                kind: "profile visibility",
                value: other.to_string(),
            }),
        }
    }
}
