//! Database repository for subscription quota records (bills).
//!
//! A bill funds usage only while it is enabled, paid, and its period contains the deduction
//! time. Its `left_quota` only ever decreases, and only through [`Bills::try_deduct`], whose
//! single conditional `UPDATE` is what prevents concurrent deductions from overdrawing it.

use crate::db::{
    errors::Result,
    models::bills::{BillDBResponse, BillPeriodType, BillStatus},
};
use crate::types::{BillId, GroupId, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgConnection};
use tracing::instrument;

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct Bill {
    pub id: BillId,
    pub user_id: UserId,
    pub user_group_id: Option<GroupId>,
    pub period_type: BillPeriodType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_quota: Decimal,
    pub left_quota: Decimal,
    pub daily_quota: Decimal,
    pub daily_used: Decimal,
    pub daily_used_on: Option<NaiveDate>,
    pub is_enabled: bool,
    pub status: BillStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Bill> for BillDBResponse {
    fn from(bill: Bill) -> Self {
        Self {
            id: bill.id,
            user_id: bill.user_id,
            user_group_id: bill.user_group_id,
            period_type: bill.period_type,
            period_start: bill.period_start,
            period_end: bill.period_end,
            total_quota: bill.total_quota,
            left_quota: bill.left_quota,
            daily_quota: bill.daily_quota,
            daily_used: bill.daily_used,
            daily_used_on: bill.daily_used_on,
            is_enabled: bill.is_enabled,
            status: bill.status,
            created_at: bill.created_at,
            updated_at: bill.updated_at,
        }
    }
}

const BILL_COLUMNS: &str = "id, user_id, user_group_id, period_type, period_start, period_end, total_quota, left_quota, \
     daily_quota, daily_used, daily_used_on, is_enabled, status, created_at, updated_at";

pub struct Bills<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Bills<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_id(&mut self, id: BillId) -> Result<Option<BillDBResponse>> {
        let bill = sqlx::query_as::<_, Bill>(&format!("SELECT {BILL_COLUMNS} FROM bills WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(bill.map(BillDBResponse::from))
    }

    /// Bills that could currently cover `amount` for the user, in deduction order.
    ///
    /// The group scope must match exactly: `None` only matches bills with no group. Order is
    /// earliest period end first, then lowest id, so the same state always yields the same
    /// candidate list.
    #[instrument(skip(self), err)]
    pub async fn list_eligible(
        &mut self,
        user_id: UserId,
        user_group_id: Option<GroupId>,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<BillDBResponse>> {
        let bills = sqlx::query_as::<_, Bill>(&format!(
            r#"
            SELECT {BILL_COLUMNS}
            FROM bills
            WHERE user_id = $1
              AND user_group_id IS NOT DISTINCT FROM $2::BIGINT
              AND is_enabled = TRUE
              AND status = 'paid'
              AND period_start <= $3
              AND period_end > $3
              AND left_quota >= $4
              AND (daily_quota = 0
                   OR (CASE WHEN daily_used_on = $5 THEN daily_used ELSE 0 END) + $4 <= daily_quota)
            ORDER BY period_end ASC, id ASC
            "#
        ))
        .bind(user_id)
        .bind(user_group_id)
        .bind(now)
        .bind(amount)
        .bind(now.date_naive())
        .fetch_all(&mut *self.db)
        .await?;

        Ok(bills.into_iter().map(BillDBResponse::from).collect())
    }

    /// Atomically take `amount` from a bill, returning the remaining quota.
    ///
    /// Every eligibility condition is re-checked in the `WHERE` clause, so a bill that a
    /// concurrent transaction drained (or disabled) since it was listed is left untouched and
    /// `None` is returned.
    #[instrument(skip(self), err)]
    pub async fn try_deduct(&mut self, id: BillId, amount: Decimal, now: DateTime<Utc>) -> Result<Option<Decimal>> {
        let remaining = sqlx::query_scalar::<_, Decimal>(
            r#"
            UPDATE bills SET
                left_quota = left_quota - $2,
                daily_used = CASE WHEN daily_used_on = $4 THEN daily_used + $2 ELSE $2 END,
                daily_used_on = $4,
                updated_at = NOW()
            WHERE id = $1
              AND is_enabled = TRUE
              AND status = 'paid'
              AND period_start <= $3
              AND period_end > $3
              AND left_quota >= $2
              AND (daily_quota = 0
                   OR (CASE WHEN daily_used_on = $4 THEN daily_used ELSE 0 END) + $2 <= daily_quota)
            RETURNING left_quota
            "#,
        )
        .bind(id)
        .bind(amount)
        .bind(now)
        .bind(now.date_naive())
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(remaining)
    }
}
