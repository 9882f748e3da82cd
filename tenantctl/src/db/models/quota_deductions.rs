//! Database models for the quota deduction ledger.

use crate::types::{GroupId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which kind of funding record a deduction was taken from, stored as TEXT in database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FundingSource {
    Bill,
    PrepaidCard,
}

impl FundingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundingSource::Bill => "bill",
            FundingSource::PrepaidCard => "prepaid_card",
        }
    }
}

/// Database request for recording a deduction
#[derive(Debug, Clone)]
pub struct QuotaDeductionCreateDBRequest {
    pub user_id: UserId,
    pub user_group_id: Option<GroupId>,
    pub source: FundingSource,
    pub source_id: i64,
    pub amount: Decimal,
    pub cost_micros: i64,
}

/// Database response for a recorded deduction
#[derive(Debug, Clone)]
pub struct QuotaDeductionDBResponse {
    pub id: i64,
    pub user_id: UserId,
    pub user_group_id: Option<GroupId>,
    pub source: FundingSource,
    pub source_id: i64,
    pub amount: Decimal,
    pub cost_micros: i64,
    pub created_at: DateTime<Utc>,
}
