//! Database repository for the quota deduction ledger.
//!
//! One row per successful deduction, written in the same transaction as the balance update.
//! Rows carry no deduplication key: recording the same charge twice yields two rows.

use crate::db::{
    errors::Result,
    models::quota_deductions::{FundingSource, QuotaDeductionCreateDBRequest, QuotaDeductionDBResponse},
};
use crate::types::{GroupId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgConnection};
use tracing::instrument;

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct QuotaDeduction {
    pub id: i64,
    pub user_id: UserId,
    pub user_group_id: Option<GroupId>,
    pub source: FundingSource,
    pub source_id: i64,
    pub amount: Decimal,
    pub cost_micros: i64,
    pub created_at: DateTime<Utc>,
}

impl From<QuotaDeduction> for QuotaDeductionDBResponse {
    fn from(row: QuotaDeduction) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            user_group_id: row.user_group_id,
            source: row.source,
            source_id: row.source_id,
            amount: row.amount,
            cost_micros: row.cost_micros,
            created_at: row.created_at,
        }
    }
}

pub struct QuotaDeductions<'c> {
    db: &'c mut PgConnection,
}

impl<'c> QuotaDeductions<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(user_id = request.user_id, source = request.source.as_str()), err)]
    pub async fn create(&mut self, request: &QuotaDeductionCreateDBRequest) -> Result<QuotaDeductionDBResponse> {
        let row = sqlx::query_as::<_, QuotaDeduction>(
            r#"
            INSERT INTO quota_deductions (user_id, user_group_id, source, source_id, amount, cost_micros)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, user_id, user_group_id, source, source_id, amount, cost_micros, created_at
            "#,
        )
        .bind(request.user_id)
        .bind(request.user_group_id)
        .bind(request.source)
        .bind(request.source_id)
        .bind(request.amount)
        .bind(request.cost_micros)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(QuotaDeductionDBResponse::from(row))
    }

    /// List deductions for a user, newest first
    #[instrument(skip(self), err)]
    pub async fn list_user_deductions(&mut self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<QuotaDeductionDBResponse>> {
        let rows = sqlx::query_as::<_, QuotaDeduction>(
            r#"
            SELECT id, user_id, user_group_id, source, source_id, amount, cost_micros, created_at
            FROM quota_deductions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(rows.into_iter().map(QuotaDeductionDBResponse::from).collect())
    }
}
