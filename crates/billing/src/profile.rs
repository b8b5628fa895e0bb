//! Profile visibility enforcement
//!
//! A profile may only stay public while its owner holds an active
//! `can_publish_profile` entitlement. [`ProfileVisibilityService`] is the one
//! place that decides whether a profile has to be forced private; the
//! reconciler and the on-demand enforcement endpoint both call it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stagehand_shared::{EntitlementKey, ProfileVisibility, SharedClock};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::most_future_expiring;
use crate::error::BillingResult;
use crate::store::BillingStore;

/// Visibility part of a talent profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub visibility: ProfileVisibility,
    pub published_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl Profile {
    pub fn public(user_id: Uuid, published_at: OffsetDateTime) -> Self {
        Self {
            user_id,
            visibility: ProfileVisibility::Public,
            published_at: Some(published_at),
            updated_at: published_at,
        }
    }

    pub fn private(user_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            visibility: ProfileVisibility::Private,
            published_at: None,
            updated_at: now,
        }
    }
}

#[derive(Clone)]
pub struct ProfileVisibilityService {
    store: Arc<dyn BillingStore>,
    clock: SharedClock,
}

impl ProfileVisibilityService {
    pub fn new(store: Arc<dyn BillingStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Whether the user's most-future-expiring publish grant is still active
    pub async fn has_active_publish_entitlement(&self, user_id: Uuid) -> BillingResult<bool> {
        let now = self.clock.now();
        let rows = self
            .store
            .entitlements_for_user(user_id, EntitlementKey::CanPublishProfile)
            .await?;

        Ok(most_future_expiring(&rows).is_some_and(|e| e.is_active(now)))
    }

    /// Force the profile private if the user lost publish rights
    ///
    /// Returns true only when this call changed the profile. No write happens
    /// while the entitlement is active or the profile is already private.
    pub async fn auto_unpublish_if_no_entitlement(&self, user_id: Uuid) -> BillingResult<bool> {
        if self.has_active_publish_entitlement(user_id).await? {
            tracing::debug!(user_id = %user_id, "Publish entitlement active, profile left as is");
            return Ok(false);
        }

        let profile = match self.store.get_profile(user_id).await? {
            Some(profile) => profile,
            None => {
                tracing::debug!(user_id = %user_id, "No profile to unpublish");
                return Ok(false);
            }
        };

        if profile.visibility == ProfileVisibility::Private {
            return Ok(false);
        }

        let changed = self
            .store
            .unpublish_profile(user_id, self.clock.now())
            .await?;

        if changed {
            tracing::info!(
                user_id = %user_id,
                published_at = ?profile.published_at,
                "Profile forced private: no active publish entitlement"
            );
        }

        Ok(changed)
    }
}
