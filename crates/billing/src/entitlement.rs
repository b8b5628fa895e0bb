//! Entitlements
//!
//! An entitlement is a capability grant (publish rights, job post credits)
//! held by a user. Revocation never deletes a row: it moves `expires_at` to
//! the revocation time, and whether a row still counts is derived from that
//! timestamp at read time via [`Entitlement::state`].

use serde::{Deserialize, Serialize};
use stagehand_shared::EntitlementKey;
use time::OffsetDateTime;
use uuid::Uuid;

/// A capability grant row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key: EntitlementKey,
    /// `None` never expires
    pub expires_at: Option<OffsetDateTime>,
    /// Only meaningful for job post credits; `None` is an unmetered grant
    pub remaining_credits: Option<i32>,
    /// Subscription whose lifetime backs this grant, if any
    pub subscription_id: Option<Uuid>,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Whether an entitlement counts at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntitlementState {
    Active,
    Expired { expired_at: OffsetDateTime },
}

impl EntitlementState {
    pub fn is_active(&self) -> bool {
        matches!(self, EntitlementState::Active)
    }
}

impl Entitlement {
    /// New grant row, not yet persisted
    pub fn new(
        user_id: Uuid,
        key: EntitlementKey,
        expires_at: Option<OffsetDateTime>,
        remaining_credits: Option<i32>,
        subscription_id: Option<Uuid>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            key,
            expires_at,
            remaining_credits,
            subscription_id,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Active iff the expiry is unset or strictly in the future
    pub fn state(&self, now: OffsetDateTime) -> EntitlementState {
        match self.expires_at {
            Some(expired_at) if expired_at <= now => EntitlementState::Expired { expired_at },
            _ => EntitlementState::Active,
        }
    }

    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.state(now).is_active()
    }
}

/// Row with the latest expiry; a `None` expiry sorts after every timestamp
pub fn most_future_expiring(rows: &[Entitlement]) -> Option<&Entitlement> {
    rows.iter().max_by(|a, b| match (a.expires_at, b.expires_at) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (Some(_), None) => std::cmp::Ordering::Less,
        (Some(x), Some(y)) => x.cmp(&y),
    })
}
