//! Group-isolated quota deduction.
//!
//! A request's cost is charged against exactly one funding source in the caller's billing
//! scope, tried in this order:
//!
//! 1. Subscription bills for `(user, group)` whose period contains now, earliest period end
//!    first, then lowest id.
//! 2. Prepaid cards redeemed by the user for the same group, oldest redemption first, then
//!    lowest id.
//!
//! The group must match exactly: a request scoped to group A never touches a group B record,
//! and an unscoped request only touches unscoped records. The first single source that covers
//! the whole amount is charged; amounts are never split across sources.
//!
//! Each decrement is one conditional `UPDATE ... WHERE left >= amount`. Under concurrency a
//! row that looked eligible may already be drained by the time we update it, in which case the
//! update matches nothing and the next candidate is tried. Balances therefore never go below
//! zero without any advisory locking, and records in different groups never contend.
//!
//! Deductions are **not idempotent**: calling [`QuotaEngine::deduct`] twice with the same
//! arguments charges twice. Callers that retry must deduplicate themselves.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, instrument};

use crate::db::errors::DbError;
use crate::db::handlers::{Bills, PrepaidCards, QuotaDeductions};
use crate::db::models::quota_deductions::{FundingSource, QuotaDeductionCreateDBRequest};
use crate::errors::{Error, Result};
use crate::selector::AccessMetadata;
use crate::types::{BillId, GroupId, PrepaidCardId, UserId};

/// Where a deduction landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeductionOutcome {
    Bill { bill_id: BillId, remaining: Decimal },
    PrepaidCard { card_id: PrepaidCardId, remaining: Decimal },
    /// Zero amount. Nothing was charged and no ledger entry was written
    Free,
    /// No single funding source could cover the amount; nothing was changed
    Insufficient,
}

impl DeductionOutcome {
    /// Whether the amount is paid for. True for [`DeductionOutcome::Free`].
    pub fn deducted(&self) -> bool {
        !matches!(self, DeductionOutcome::Insufficient)
    }

    pub fn source(&self) -> Option<FundingSource> {
        match self {
            DeductionOutcome::Bill { .. } => Some(FundingSource::Bill),
            DeductionOutcome::PrepaidCard { .. } => Some(FundingSource::PrepaidCard),
            DeductionOutcome::Free | DeductionOutcome::Insufficient => None,
        }
    }
}

/// Applies request costs to bills and prepaid cards.
#[derive(Debug, Clone)]
pub struct QuotaEngine {
    db: PgPool,
}

impl QuotaEngine {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Deduct `amount` inside the caller's transaction.
    ///
    /// Returns [`DeductionOutcome::Insufficient`] without modifying anything when no source
    /// covers the amount. A zero amount returns [`DeductionOutcome::Free`] without looking at
    /// any funding source; a negative amount or cost is a [`Error::BadRequest`]. Store errors propagate; the caller must then drop or roll back the
    /// transaction. A transaction that is dropped before commit (e.g. because the request was
    /// cancelled) rolls back the deduction and its ledger entry together.
    pub async fn deduct(
        &self,
        conn: &mut PgConnection,
        user_id: UserId,
        group_id: Option<GroupId>,
        amount: Decimal,
        cost_micros: i64,
    ) -> Result<DeductionOutcome> {
        self.deduct_at(conn, user_id, group_id, amount, cost_micros, Utc::now()).await
    }

    /// [`deduct`](Self::deduct) with an explicit "now" for period, expiry and daily checks.
    #[instrument(skip(self, conn), err)]
    pub async fn deduct_at(
        &self,
        conn: &mut PgConnection,
        user_id: UserId,
        group_id: Option<GroupId>,
        amount: Decimal,
        cost_micros: i64,
        now: DateTime<Utc>,
    ) -> Result<DeductionOutcome> {
        if amount < Decimal::ZERO {
            return Err(Error::BadRequest {
                message: format!("Deduction amount must not be negative, got {amount}"),
            });
        }
        if cost_micros < 0 {
            return Err(Error::BadRequest {
                message: format!("Cost micros must not be negative, got {cost_micros}"),
            });
        }
        if amount.is_zero() {
            debug!(user_id, group_id, "Nothing to deduct for a zero amount");
            metrics::counter!("tenantctl_quota_deductions_total", "source" => "free").increment(1);
            return Ok(DeductionOutcome::Free);
        }

        let outcome = match Self::deduct_from_bills(conn, user_id, group_id, amount, now).await? {
            Some(outcome) => outcome,
            None => Self::deduct_from_prepaid_cards(conn, user_id, group_id, amount, now)
                .await?
                .unwrap_or(DeductionOutcome::Insufficient),
        };

        let (source, source_id) = match &outcome {
            DeductionOutcome::Bill { bill_id, .. } => (FundingSource::Bill, *bill_id),
            DeductionOutcome::PrepaidCard { card_id, .. } => (FundingSource::PrepaidCard, *card_id),
            DeductionOutcome::Free => return Ok(outcome),
            DeductionOutcome::Insufficient => {
                debug!(user_id, group_id, %amount, "No funding source covers the amount");
                metrics::counter!("tenantctl_quota_deductions_total", "source" => "insufficient").increment(1);
                return Ok(outcome);
            }
        };

        QuotaDeductions::new(&mut *conn)
            .create(&QuotaDeductionCreateDBRequest {
                user_id,
                user_group_id: group_id,
                source,
                source_id,
                amount,
                cost_micros,
            })
            .await?;

        metrics::counter!("tenantctl_quota_deductions_total", "source" => source.as_str()).increment(1);
        debug!(user_id, group_id, %amount, source = source.as_str(), source_id, "Deducted quota");
        Ok(outcome)
    }

    async fn deduct_from_bills(
        conn: &mut PgConnection,
        user_id: UserId,
        group_id: Option<GroupId>,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<DeductionOutcome>> {
        let mut bills = Bills::new(conn);
        for bill in bills.list_eligible(user_id, group_id, amount, now).await? {
            if let Some(remaining) = bills.try_deduct(bill.id, amount, now).await? {
                return Ok(Some(DeductionOutcome::Bill {
                    bill_id: bill.id,
                    remaining,
                }));
            }
            debug!(bill_id = bill.id, "Bill drained concurrently, trying next");
        }
        Ok(None)
    }

    async fn deduct_from_prepaid_cards(
        conn: &mut PgConnection,
        user_id: UserId,
        group_id: Option<GroupId>,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<DeductionOutcome>> {
        let mut cards = PrepaidCards::new(conn);
        for card in cards.list_eligible(user_id, group_id, amount, now).await? {
            if let Some(remaining) = cards.try_deduct(card.id, amount, now).await? {
                return Ok(Some(DeductionOutcome::PrepaidCard {
                    card_id: card.id,
                    remaining,
                }));
            }
            debug!(card_id = card.id, "Prepaid card drained concurrently, trying next");
        }
        Ok(None)
    }

    /// Deduct in a transaction of its own, committing only when a source covered the amount.
    ///
    /// Unlike [`deduct`](Self::deduct), running out of funds is an
    /// [`Error::InsufficientFunds`].
    #[instrument(skip(self), err)]
    pub async fn charge(
        &self,
        user_id: UserId,
        group_id: Option<GroupId>,
        amount: Decimal,
        cost_micros: i64,
    ) -> Result<DeductionOutcome> {
        let mut tx = self.db.begin().await.map_err(DbError::from)?;
        let outcome = self.deduct(&mut tx, user_id, group_id, amount, cost_micros).await?;

        if !outcome.deducted() {
            tx.rollback().await.map_err(DbError::from)?;
            return Err(Error::InsufficientFunds {
                user_id,
                group_id,
                amount,
            });
        }

        tx.commit().await.map_err(DbError::from)?;
        info!(user_id, group_id, %amount, "Charged request cost");
        Ok(outcome)
    }

    /// Charge the caller and billing scope recorded in a request's metadata by
    /// [`Selector::pick`](crate::selector::Selector::pick).
    pub async fn charge_request(&self, meta: &AccessMetadata, amount: Decimal, cost_micros: i64) -> Result<DeductionOutcome> {
        let user_id = meta.user_id().ok_or_else(|| Error::BadRequest {
            message: "Request metadata carries no caller to charge".to_string(),
        })?;
        self.charge(user_id, meta.billing_group_id(), amount, cost_micros).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::{Bills, PrepaidCards, QuotaDeductions};
    use crate::db::models::bills::BillStatus;
    use crate::test_utils::{BillSeed, CardSeed, create_bill, create_prepaid_card, create_test_user, create_user_group};
    use std::str::FromStr;

    async fn left_quota(pool: &PgPool, bill_id: BillId) -> Decimal {
        let mut conn = pool.acquire().await.unwrap();
        Bills::new(&mut conn).get_by_id(bill_id).await.unwrap().unwrap().left_quota
    }

    async fn balance(pool: &PgPool, card_id: PrepaidCardId) -> Decimal {
        let mut conn = pool.acquire().await.unwrap();
        PrepaidCards::new(&mut conn).get_by_id(card_id).await.unwrap().unwrap().balance
    }

    async fn ledger_len(pool: &PgPool, user_id: UserId) -> usize {
        let mut conn = pool.acquire().await.unwrap();
        QuotaDeductions::new(&mut conn)
            .list_user_deductions(user_id, 0, 1000)
            .await
            .unwrap()
            .len()
    }

    #[sqlx::test]
    async fn test_bill_deduction_respects_group(pool: PgPool) {
        let g1 = create_user_group(&pool, "g1").await;
        let g2 = create_user_group(&pool, "g2").await;
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill1 = create_bill(&pool, BillSeed::new(user, Some(g1), Decimal::from(10))).await;
        let bill2 = create_bill(&pool, BillSeed::new(user, Some(g2), Decimal::from(10))).await;

        let engine = QuotaEngine::new(pool.clone());
        let mut tx = pool.begin().await.unwrap();
        let outcome = engine
            .deduct(&mut tx, user, Some(g1), Decimal::from(5), 5_000_000)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            outcome,
            DeductionOutcome::Bill {
                bill_id: bill1,
                remaining: Decimal::from(5)
            }
        );
        assert_eq!(left_quota(&pool, bill1).await, Decimal::from(5));
        assert_eq!(left_quota(&pool, bill2).await, Decimal::from(10));
    }

    #[sqlx::test]
    async fn test_prepaid_deduction_respects_group(pool: PgPool) {
        let g1 = create_user_group(&pool, "g1").await;
        let g2 = create_user_group(&pool, "g2").await;
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let card1 = create_prepaid_card(&pool, CardSeed::new("sn1", Some(user), Some(g1), Decimal::from(10))).await;
        let card2 = create_prepaid_card(&pool, CardSeed::new("sn2", Some(user), Some(g2), Decimal::from(10))).await;

        let engine = QuotaEngine::new(pool.clone());
        let mut tx = pool.begin().await.unwrap();
        let outcome = engine
            .deduct(&mut tx, user, Some(g1), Decimal::from(5), 5_000_000)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(outcome.source(), Some(FundingSource::PrepaidCard));
        assert_eq!(balance(&pool, card1).await, Decimal::from(5));
        assert_eq!(balance(&pool, card2).await, Decimal::from(10));
    }

    #[sqlx::test]
    async fn test_unscoped_request_only_touches_unscoped_records(pool: PgPool) {
        let g1 = create_user_group(&pool, "g1").await;
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let scoped = create_bill(&pool, BillSeed::new(user, Some(g1), Decimal::from(10))).await;
        let unscoped = create_bill(&pool, BillSeed::new(user, None, Decimal::from(10))).await;

        let engine = QuotaEngine::new(pool.clone());
        engine.charge(user, None, Decimal::from(4), 4_000_000).await.unwrap();

        assert_eq!(left_quota(&pool, unscoped).await, Decimal::from(6));
        assert_eq!(left_quota(&pool, scoped).await, Decimal::from(10));
    }

    #[sqlx::test]
    async fn test_group_with_funding_cannot_be_deleted(pool: PgPool) {
        let g1 = create_user_group(&pool, "g1").await;
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill = create_bill(&pool, BillSeed::new(user, Some(g1), Decimal::from(10))).await;
        let card = create_prepaid_card(&pool, CardSeed::new("sn1", Some(user), Some(g1), Decimal::from(10))).await;

        let err = sqlx::query("DELETE FROM user_groups WHERE id = $1")
            .bind(g1)
            .execute(&pool)
            .await
            .unwrap_err();
        assert!(matches!(DbError::from(err), DbError::ForeignKeyViolation { .. }));

        let engine = QuotaEngine::new(pool.clone());
        let err = engine.charge(user, None, Decimal::from(4), 4_000_000).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let mut conn = pool.acquire().await.unwrap();
        let stored = Bills::new(&mut conn).get_by_id(bill).await.unwrap().unwrap();
        assert_eq!(stored.user_group_id, Some(g1));
        assert_eq!(stored.left_quota, Decimal::from(10));
        drop(conn);
        assert_eq!(balance(&pool, card).await, Decimal::from(10));
    }

    #[sqlx::test]
    async fn test_falls_back_to_prepaid_when_no_bill_covers_amount(pool: PgPool) {
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill = create_bill(&pool, BillSeed::new(user, None, Decimal::from(3))).await;
        let card = create_prepaid_card(&pool, CardSeed::new("sn1", Some(user), None, Decimal::from(10))).await;

        let engine = QuotaEngine::new(pool.clone());
        let outcome = engine.charge(user, None, Decimal::from(5), 5_000_000).await.unwrap();

        assert_eq!(
            outcome,
            DeductionOutcome::PrepaidCard {
                card_id: card,
                remaining: Decimal::from(5)
            }
        );
        // No split: the bill is left as it was
        assert_eq!(left_quota(&pool, bill).await, Decimal::from(3));
    }

    #[sqlx::test]
    async fn test_bills_are_tried_before_prepaid_cards(pool: PgPool) {
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill = create_bill(&pool, BillSeed::new(user, None, Decimal::from(10))).await;
        let card = create_prepaid_card(&pool, CardSeed::new("sn1", Some(user), None, Decimal::from(10))).await;

        let engine = QuotaEngine::new(pool.clone());
        let outcome = engine.charge(user, None, Decimal::from(1), 1_000_000).await.unwrap();

        assert_eq!(outcome.source(), Some(FundingSource::Bill));
        assert_eq!(left_quota(&pool, bill).await, Decimal::from(9));
        assert_eq!(balance(&pool, card).await, Decimal::from(10));
    }

    #[sqlx::test]
    async fn test_ineligible_bills_are_skipped(pool: PgPool) {
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let mut pending = BillSeed::new(user, None, Decimal::from(10));
        pending.status = BillStatus::Pending;
        let pending = create_bill(&pool, pending).await;
        let card = create_prepaid_card(&pool, CardSeed::new("sn1", Some(user), None, Decimal::from(10))).await;

        let engine = QuotaEngine::new(pool.clone());
        engine.charge(user, None, Decimal::from(2), 2_000_000).await.unwrap();

        assert_eq!(left_quota(&pool, pending).await, Decimal::from(10));
        assert_eq!(balance(&pool, card).await, Decimal::from(8));
    }

    #[sqlx::test]
    async fn test_insufficient_funds_changes_nothing(pool: PgPool) {
        let g1 = create_user_group(&pool, "g1").await;
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill = create_bill(&pool, BillSeed::new(user, Some(g1), Decimal::from(3))).await;
        let card = create_prepaid_card(&pool, CardSeed::new("sn1", Some(user), Some(g1), Decimal::from(4))).await;

        let engine = QuotaEngine::new(pool.clone());
        let mut tx = pool.begin().await.unwrap();
        let outcome = engine
            .deduct(&mut tx, user, Some(g1), Decimal::from(5), 5_000_000)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(outcome, DeductionOutcome::Insufficient);
        assert!(!outcome.deducted());

        let err = engine.charge(user, Some(g1), Decimal::from(5), 5_000_000).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { amount, .. } if amount == Decimal::from(5)));

        assert_eq!(left_quota(&pool, bill).await, Decimal::from(3));
        assert_eq!(balance(&pool, card).await, Decimal::from(4));
        assert_eq!(ledger_len(&pool, user).await, 0);
    }

    #[sqlx::test]
    async fn test_uncommitted_deduction_rolls_back(pool: PgPool) {
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill = create_bill(&pool, BillSeed::new(user, None, Decimal::from(10))).await;

        let engine = QuotaEngine::new(pool.clone());
        {
            let mut tx = pool.begin().await.unwrap();
            let outcome = engine
                .deduct(&mut tx, user, None, Decimal::from(4), 4_000_000)
                .await
                .unwrap();
            assert!(outcome.deducted());
            // Dropped without commit
        }

        assert_eq!(left_quota(&pool, bill).await, Decimal::from(10));
        assert_eq!(ledger_len(&pool, user).await, 0);
    }

    #[sqlx::test]
    async fn test_deduction_is_not_idempotent(pool: PgPool) {
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill = create_bill(&pool, BillSeed::new(user, None, Decimal::from(10))).await;

        let engine = QuotaEngine::new(pool.clone());
        engine.charge(user, None, Decimal::from(3), 3_000_000).await.unwrap();
        engine.charge(user, None, Decimal::from(3), 3_000_000).await.unwrap();

        assert_eq!(left_quota(&pool, bill).await, Decimal::from(4));
        assert_eq!(ledger_len(&pool, user).await, 2);
    }

    #[sqlx::test]
    async fn test_ledger_records_source_and_cost(pool: PgPool) {
        let g1 = create_user_group(&pool, "g1").await;
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill = create_bill(&pool, BillSeed::new(user, Some(g1), Decimal::from(10))).await;

        let engine = QuotaEngine::new(pool.clone());
        let amount = Decimal::from_str("1.25").unwrap();
        engine.charge(user, Some(g1), amount, 1_250_000).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let entries = QuotaDeductions::new(&mut conn)
            .list_user_deductions(user, 0, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, FundingSource::Bill);
        assert_eq!(entries[0].source_id, bill);
        assert_eq!(entries[0].user_group_id, Some(g1));
        assert_eq!(entries[0].amount, amount);
        assert_eq!(entries[0].cost_micros, 1_250_000);
    }

    #[sqlx::test]
    async fn test_concurrent_deductions_drain_exactly_to_zero(pool: PgPool) {
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill = create_bill(&pool, BillSeed::new(user, None, Decimal::from(10))).await;
        let engine = QuotaEngine::new(pool.clone());

        let results = futures::future::join_all((0..10).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.charge(user, None, Decimal::ONE, 1_000_000).await })
        }))
        .await;
        for result in results {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(left_quota(&pool, bill).await, Decimal::ZERO);
        assert_eq!(ledger_len(&pool, user).await, 10);
    }

    #[sqlx::test]
    async fn test_concurrent_overdraft_is_refused(pool: PgPool) {
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill = create_bill(&pool, BillSeed::new(user, None, Decimal::from(10))).await;
        let engine = QuotaEngine::new(pool.clone());

        let mut handles = Vec::new();
        for _ in 0..11 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.charge(user, None, Decimal::ONE, 1_000_000).await
            }));
        }

        let mut succeeded = 0;
        let mut refused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(Error::InsufficientFunds { .. }) => refused += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!((succeeded, refused), (10, 1));
        assert_eq!(left_quota(&pool, bill).await, Decimal::ZERO);
    }

    #[sqlx::test]
    async fn test_rejects_negative_amounts(pool: PgPool) {
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let engine = QuotaEngine::new(pool.clone());
        let mut conn = pool.acquire().await.unwrap();

        let err = engine.deduct(&mut conn, user, None, Decimal::from(-1), 0).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
        let err = engine.deduct(&mut conn, user, None, Decimal::ONE, -1).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[sqlx::test]
    async fn test_zero_amount_is_free(pool: PgPool) {
        let user = create_test_user(&pool, "u1", &[], &[]).await;
        let bill = create_bill(&pool, BillSeed::new(user, None, Decimal::from(10))).await;
        let engine = QuotaEngine::new(pool.clone());

        let outcome = engine.charge(user, None, Decimal::ZERO, 0).await.unwrap();
        assert_eq!(outcome, DeductionOutcome::Free);
        assert!(outcome.deducted());
        assert_eq!(outcome.source(), None);

        // No funding source at all is still fine for a free request
        let broke = create_test_user(&pool, "u2", &[], &[]).await;
        let meta = AccessMetadata::for_user(broke);
        assert_eq!(
            engine.charge_request(&meta, Decimal::ZERO, 0).await.unwrap(),
            DeductionOutcome::Free
        );

        assert_eq!(left_quota(&pool, bill).await, Decimal::from(10));
        assert_eq!(ledger_len(&pool, user).await, 0);
        assert_eq!(ledger_len(&pool, broke).await, 0);
    }

    #[sqlx::test]
    async fn test_charge_request_reads_billing_scope_from_metadata(pool: PgPool) {
        let g1 = create_user_group(&pool, "g1").await;
        let user = create_test_user(&pool, "u1", &[g1], &[]).await;
        let scoped = create_bill(&pool, BillSeed::new(user, Some(g1), Decimal::from(10))).await;
        let unscoped = create_bill(&pool, BillSeed::new(user, None, Decimal::from(10))).await;

        let engine = QuotaEngine::new(pool.clone());
        let mut meta = AccessMetadata::for_user(user);
        meta.set_billing_group_id(Some(g1));
        engine.charge_request(&meta, Decimal::from(2), 2_000_000).await.unwrap();

        assert_eq!(left_quota(&pool, scoped).await, Decimal::from(8));
        assert_eq!(left_quota(&pool, unscoped).await, Decimal::from(10));

        let err = engine
            .charge_request(&AccessMetadata::new(), Decimal::ONE, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }
}
