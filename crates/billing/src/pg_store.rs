//! PostgreSQL-backed [`BillingStore`]
//!
//! Conditional writes are expressed as `UPDATE ... WHERE version = $n` and a
//! zero row count becomes a concurrency conflict. Multi-row writes run in a
//! transaction so a conflict on any row rolls back the whole change.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use stagehand_shared::{EntitlementKey, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::{most_future_expiring, Entitlement};
use crate::error::{BillingError, BillingResult};
use crate::profile::Profile;
use crate::store::{BillingStore, ExpiryPlan, GrantCandidate, PublishGrant};
use crate::subscriptions::Subscription;

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, price_id, status, current_period_end, \
     cancel_at_period_end, version, created_at, updated_at";

const ENTITLEMENT_COLUMNS: &str = "id, user_id, key, expires_at, remaining_credits, \
     subscription_id, version, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    price_id: String,
    status: String,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            price_id: row.price_id,
            status: row.status.parse()?,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntitlementRow {
    id: Uuid,
    user_id: Uuid,
    key: String,
    expires_at: Option<OffsetDateTime>,
    remaining_credits: Option<i32>,
    subscription_id: Option<Uuid>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<EntitlementRow> for Entitlement {
    type Error = BillingError;

    fn try_from(row: EntitlementRow) -> Result<Self, Self::Error> {
        Ok(Entitlement {
            id: row.id,
            user_id: row.user_id,
            key: row.key.parse()?,
            expires_at: row.expires_at,
            remaining_credits: row.remaining_credits,
            subscription_id: row.subscription_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    user_id: Uuid,
    visibility: String,
    published_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl TryFrom<ProfileRow> for Profile {
    type Error = BillingError;

    fn try_from(row: ProfileRow) -> Result<Self, Self::Error> {
        Ok(Profile {
            user_id: row.user_id,
            visibility: row.visibility.parse()?,
            published_at: row.published_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Billing store over the application database
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn expire_subscription(
        tx: &mut Transaction<'_, Postgres>,
        plan: &ExpiryPlan,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, version = version + 1, updated_at = $2
            WHERE id = $3 AND status = $4 AND version = $5
            "#,
        )
        .bind(SubscriptionStatus::Expired.as_str())
        .bind(now)
        .bind(plan.subscription_id)
        .bind(plan.expected_status.as_str())
        .bind(plan.expected_version)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::subscription_conflict(plan.subscription_id));
        }

        for revocation in &plan.revocations {
            let result = sqlx::query(
                r#"
                UPDATE entitlements
                SET expires_at = $1, version = version + 1, updated_at = $1
                WHERE id = $2 AND version = $3
                "#,
            )
            .bind(now)
            .bind(revocation.entitlement_id)
            .bind(revocation.expected_version)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(BillingError::entitlement_conflict(revocation.entitlement_id));
            }
        }

        Ok(())
    }

    async fn write_publish_grant(
        tx: &mut Transaction<'_, Postgres>,
        grant: &PublishGrant,
        now: OffsetDateTime,
    ) -> BillingResult<Entitlement> {
        // Lock the backing subscription so it cannot expire mid-grant
        let current: Option<(String, i64)> =
            sqlx::query_as("SELECT status, version FROM subscriptions WHERE id = $1 FOR UPDATE")
                .bind(grant.subscription_id)
                .fetch_optional(&mut **tx)
                .await?;

        let still_active = matches!(
            current,
            Some((ref status, version))
                if status == SubscriptionStatus::Active.as_str()
                    && version == grant.subscription_version
        );
        if !still_active {
            return Err(BillingError::subscription_conflict(grant.subscription_id));
        }

        let row: Option<EntitlementRow> = match grant.existing {
            Some((id, expected_version)) => {
                let row = sqlx::query_as(&format!(
                    "UPDATE entitlements \
                     SET expires_at = NULL, version = version + 1, updated_at = $1 \
                     WHERE id = $2 AND version = $3 \
                     RETURNING {ENTITLEMENT_COLUMNS}"
                ))
                .bind(now)
                .bind(id)
                .bind(expected_version)
                .fetch_optional(&mut **tx)
                .await?;
                if row.is_none() {
                    return Err(BillingError::entitlement_conflict(id));
                }
                row
            }
            None => {
                let fresh = Entitlement::new(
                    grant.user_id,
                    EntitlementKey::CanPublishProfile,
                    None,
                    None,
                    Some(grant.subscription_id),
                    now,
                );
                sqlx::query_as(&format!(
                    "INSERT INTO entitlements \
                     (id, user_id, key, expires_at, remaining_credits, subscription_id, \
                      version, created_at, updated_at) \
                     VALUES ($1, $2, $3, NULL, NULL, $4, 0, $5, $5) \
                     RETURNING {ENTITLEMENT_COLUMNS}"
                ))
                .bind(fresh.id)
                .bind(fresh.user_id)
                .bind(fresh.key.as_str())
                .bind(grant.subscription_id)
                .bind(now)
                .fetch_optional(&mut **tx)
                .await?
            }
        };

        row.ok_or_else(|| BillingError::InvalidData("grant write returned no row".to_string()))?
            .try_into()
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn latest_subscription_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn set_cancel_at_period_end(
        &self,
        user_id: Uuid,
        cancel_at_period_end: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "UPDATE subscriptions \
             SET cancel_at_period_end = $1, version = version + 1, updated_at = $2 \
             WHERE id = ( \
                 SELECT id FROM subscriptions WHERE user_id = $3 \
                 ORDER BY created_at DESC LIMIT 1 \
             ) \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(cancel_at_period_end)
        .bind(now)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn list_due_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE status IN ('active', 'canceled') AND current_period_end <= $1 \
             ORDER BY current_period_end, id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn list_live_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE status IN ('active', 'canceled') AND current_period_end > $1 \
             ORDER BY user_id, created_at"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn list_grant_candidates(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<GrantCandidate>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions s \
             WHERE s.status = 'active' AND s.current_period_end > $1 \
             AND NOT EXISTS ( \
                 SELECT 1 FROM entitlements e \
                 WHERE e.subscription_id = s.id AND e.key = 'can_publish_profile' \
                 AND (e.expires_at IS NULL OR e.expires_at > $1) \
             ) \
             ORDER BY s.created_at, s.id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        let subscriptions: Vec<Subscription> = convert_all(rows)?;
        if subscriptions.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = subscriptions.iter().map(|s| s.id).collect();
        let backed: Vec<EntitlementRow> = sqlx::query_as(&format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements \
             WHERE subscription_id = ANY($1) AND key = 'can_publish_profile'"
        ))
        .bind(&ids[..])
        .fetch_all(&self.pool)
        .await?;
        let backed: Vec<Entitlement> = convert_all(backed)?;

        Ok(subscriptions
            .into_iter()
            .map(|subscription| {
                let own: Vec<Entitlement> = backed
                    .iter()
                    .filter(|e| e.subscription_id == Some(subscription.id))
                    .cloned()
                    .collect();
                GrantCandidate {
                    existing: most_future_expiring(&own).cloned(),
                    subscription,
                }
            })
            .collect())
    }

    async fn entitlements_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Entitlement>> {
        let rows: Vec<EntitlementRow> = sqlx::query_as(&format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements \
             WHERE subscription_id = $1 ORDER BY created_at, id"
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn entitlements_for_user(
        &self,
        user_id: Uuid,
        key: EntitlementKey,
    ) -> BillingResult<Vec<Entitlement>> {
        let rows: Vec<EntitlementRow> = sqlx::query_as(&format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements \
             WHERE user_id = $1 AND key = $2 ORDER BY created_at, id"
        ))
        .bind(user_id)
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn apply_expiry(&self, plan: &ExpiryPlan, now: OffsetDateTime) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        // Dropping the transaction on error rolls it back
        Self::expire_subscription(&mut tx, plan, now).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn apply_publish_grant(
        &self,
        grant: &PublishGrant,
        now: OffsetDateTime,
    ) -> BillingResult<Entitlement> {
        let mut tx = self.pool.begin().await?;
        let row = Self::write_publish_grant(&mut tx, grant, now).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn decrement_credit(
        &self,
        entitlement_id: Uuid,
        expected_version: i64,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Entitlement>> {
        let row: Option<EntitlementRow> = sqlx::query_as(&format!(
            "UPDATE entitlements \
             SET remaining_credits = remaining_credits - 1, version = version + 1, updated_at = $1 \
             WHERE id = $2 AND version = $3 AND remaining_credits > 0 \
             RETURNING {ENTITLEMENT_COLUMNS}"
        ))
        .bind(now)
        .bind(entitlement_id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Some(row.try_into()?));
        }

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM entitlements WHERE id = $1")
            .bind(entitlement_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(None),
            None => Err(BillingError::EntitlementNotFound(entitlement_id)),
        }
    }

    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            "SELECT user_id, visibility, published_at, updated_at FROM profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Profile::try_from).transpose()
    }

    async fn list_public_profiles(&self) -> BillingResult<Vec<Profile>> {
        let rows: Vec<ProfileRow> = sqlx::query_as(
            "SELECT user_id, visibility, published_at, updated_at FROM profiles \
             WHERE visibility = 'public' ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn unpublish_profile(&self, user_id: Uuid, now: OffsetDateTime) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET visibility = 'private', published_at = NULL, updated_at = $1
            WHERE user_id = $2 AND visibility = 'public'
            "#,
        )
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
