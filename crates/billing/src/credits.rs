//! Job post credit consumption

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stagehand_shared::{EntitlementKey, SharedClock};
use time::OffsetDateTime;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Delay before the single retry after an optimistic conflict
const CONFLICT_RETRY_DELAY_MS: u64 = 25;

/// The grant a job post was charged against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditRef {
    pub entitlement_id: Uuid,
    /// Credits left on that grant; `None` for unmetered grants
    pub remaining_credits: Option<i32>,
}

/// Pick the grant to charge a job post against
///
/// Unmetered grants win, then the metered grant expiring soonest. Fails
/// with the reason no grant is usable.
pub fn select_credit_row(rows: &[Entitlement], now: OffsetDateTime) -> BillingResult<&Entitlement> {
    if rows.is_empty() {
        return Err(BillingError::NoEntitlement);
    }

    let mut active = rows.iter().filter(|e| e.is_active(now)).peekable();
    if active.peek().is_none() {
        return Err(BillingError::ExpiredCredits);
    }

    active
        .filter(|e| e.remaining_credits.map_or(true, |credits| credits > 0))
        .min_by_key(|e| (e.remaining_credits.is_some(), e.expires_at.is_none(), e.expires_at))
        .ok_or(BillingError::InsufficientCredits)
}

#[derive(Clone)]
pub struct JobCreditService {
    store: Arc<dyn BillingStore>,
    clock: SharedClock,
}

impl JobCreditService {
    pub fn new(store: Arc<dyn BillingStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Charge one job post credit
    ///
    /// Fails with `NoEntitlement`, `ExpiredCredits`, or `InsufficientCredits`
    /// (terminal) or `ConcurrencyConflict` when another consumer changed the
    /// grant between read and write.
    pub async fn consume_job_credit(&self, user_id: Uuid) -> BillingResult<CreditRef> {
        let now = self.clock.now();
        let rows = self
            .store
            .entitlements_for_user(user_id, EntitlementKey::JobPostCredit)
            .await?;
        let row = select_credit_row(&rows, now)?;

        if row.remaining_credits.is_none() {
            tracing::debug!(
                user_id = %user_id,
                entitlement_id = %row.id,
                "Job post on unmetered grant"
            );
            return Ok(CreditRef {
                entitlement_id: row.id,
                remaining_credits: None,
            });
        }

        let updated = self
            .store
            .decrement_credit(row.id, row.version, now)
            .await?
            .ok_or_else(|| BillingError::entitlement_conflict(row.id))?;

        tracing::info!(
            user_id = %user_id,
            entitlement_id = %updated.id,
            remaining_credits = ?updated.remaining_credits,
            "Consumed job post credit"
        );

        Ok(CreditRef {
            entitlement_id: updated.id,
            remaining_credits: updated.remaining_credits,
        })
    }

    /// [`consume_job_credit`](Self::consume_job_credit), re-read and retried once on a conflict
    pub async fn consume_job_credit_with_retry(&self, user_id: Uuid) -> BillingResult<CreditRef> {
        let strategy = FixedInterval::from_millis(CONFLICT_RETRY_DELAY_MS).take(1);

        RetryIf::spawn(
            strategy,
            || self.consume_job_credit(user_id),
            |e: &BillingError| {
                if e.is_retryable() {
                    tracing::debug!(
                        user_id = %user_id,
                        error = %e,
                        "Retrying job credit consumption"
                    );
                }
                e.is_retryable()
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryBillingStore;
    use stagehand_shared::{Clock, ManualClock};
    use time::macros::datetime;
    use time::Duration;

    fn setup() -> (Arc<MemoryBillingStore>, JobCreditService, ManualClock) {
        let clock = ManualClock::new(datetime!(2026-03-01 12:00 UTC));
        let store = Arc::new(MemoryBillingStore::new());
        let service = JobCreditService::new(store.clone(), Arc::new(clock.clone()));
        (store, service, clock)
    }

    fn credits(
        user_id: Uuid,
        remaining: Option<i32>,
        expires_at: Option<OffsetDateTime>,
    ) -> Entitlement {
        Entitlement::new(
            user_id,
            EntitlementKey::JobPostCredit,
            expires_at,
            remaining,
            None,
            datetime!(2026-02-01 00:00 UTC),
        )
    }

    #[tokio::test]
    async fn test_no_rows_is_no_entitlement() {
        let (_store, service, _clock) = setup();
        let err = service.consume_job_credit(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BillingError::NoEntitlement));
    }

    #[tokio::test]
    async fn test_only_expired_rows_is_expired_credits() {
        let (store, service, clock) = setup();
        let user_id = Uuid::new_v4();
        store
            .insert_entitlement(credits(user_id, Some(5), Some(clock.now() - Duration::days(1))))
            .await;

        let err = service.consume_job_credit(user_id).await.unwrap_err();
        assert!(matches!(err, BillingError::ExpiredCredits));
    }

    #[tokio::test]
    async fn test_zero_credits_is_insufficient() {
        let (store, service, clock) = setup();
        let user_id = Uuid::new_v4();
        store
            .insert_entitlement(credits(user_id, Some(0), Some(clock.now() + Duration::days(10))))
            .await;
        store
            .insert_entitlement(credits(user_id, Some(4), Some(clock.now() - Duration::days(10))))
            .await;

        let err = service.consume_job_credit(user_id).await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientCredits));
    }

    #[tokio::test]
    async fn test_consumes_soonest_expiring_grant() {
        let (store, service, clock) = setup();
        let user_id = Uuid::new_v4();
        let later = credits(user_id, Some(5), Some(clock.now() + Duration::days(60)));
        let sooner = credits(user_id, Some(2), Some(clock.now() + Duration::days(5)));
        store.insert_entitlement(later.clone()).await;
        store.insert_entitlement(sooner.clone()).await;

        let credit = service.consume_job_credit(user_id).await.unwrap();
        assert_eq!(
            credit,
            CreditRef {
                entitlement_id: sooner.id,
                remaining_credits: Some(1),
            }
        );
        assert_eq!(store.entitlement(later.id).await.unwrap(), later);
    }

    #[tokio::test]
    async fn test_unmetered_grant_is_not_decremented() {
        let (store, service, _clock) = setup();
        let user_id = Uuid::new_v4();
        let unmetered = credits(user_id, None, None);
        store.insert_entitlement(unmetered.clone()).await;
        store.insert_entitlement(credits(user_id, Some(3), None)).await;

        let credit = service.consume_job_credit(user_id).await.unwrap();
        assert_eq!(credit.entitlement_id, unmetered.id);
        assert_eq!(credit.remaining_credits, None);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_last_credit_then_insufficient() {
        let (store, service, _clock) = setup();
        let user_id = Uuid::new_v4();
        store.insert_entitlement(credits(user_id, Some(1), None)).await;

        let credit = service.consume_job_credit_with_retry(user_id).await.unwrap();
        assert_eq!(credit.remaining_credits, Some(0));

        let err = service.consume_job_credit_with_retry(user_id).await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientCredits));
    }

    #[tokio::test]
    async fn test_concurrent_consumers_never_overspend() {
        let (store, service, _clock) = setup();
        let user_id = Uuid::new_v4();
        let row = credits(user_id, Some(3), None);
        store.insert_entitlement(row.clone()).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.consume_job_credit_with_retry(user_id).await
            }));
        }

        let mut consumed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => consumed += 1,
                Err(e) => assert!(matches!(
                    e,
                    BillingError::InsufficientCredits | BillingError::ConcurrencyConflict { .. }
                )),
            }
        }

        let stored = store.entitlement(row.id).await.unwrap();
        assert_eq!(stored.remaining_credits, Some(3 - consumed));
        assert!(consumed <= 3);
    }

    #[test]
    fn test_select_prefers_unmetered_then_soonest_expiry() {
        let now = datetime!(2026-03-01 12:00 UTC);
        let user_id = Uuid::new_v4();
        let open_metered = credits(user_id, Some(1), None);
        let dated = credits(user_id, Some(1), Some(now + Duration::days(1)));
        let rows = vec![open_metered.clone(), dated.clone()];
        assert_eq!(select_credit_row(&rows, now).unwrap().id, dated.id);

        let unmetered = credits(user_id, None, Some(now + Duration::days(90)));
        let rows = vec![open_metered, dated, unmetered.clone()];
        assert_eq!(select_credit_row(&rows, now).unwrap().id, unmetered.id);
    }
}
