//! Database models for subscription quota records.

use crate::types::{BillId, GroupId, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Billing period stored as TEXT in database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillPeriodType {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Payment status stored as TEXT in database. Only `Paid` bills fund usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Pending,
    Paid,
    Refunded,
}

/// Database response for a bill
#[derive(Debug, Clone)]
pub struct BillDBResponse {
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

impl BillDBResponse {
    /// Amount already charged against the daily cap on `today`.
    pub fn used_on(&self, today: NaiveDate) -> Decimal {
        if self.daily_used_on == Some(today) {
            self.daily_used
        } else {
            Decimal::ZERO
        }
    }
}
