//! Database models for redeemed prepaid balances.

use crate::types::{GroupId, PrepaidCardId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Database response for a prepaid card
#[derive(Debug, Clone)]
pub struct PrepaidCardDBResponse {
    pub id: PrepaidCardId,
    pub name: String,
    pub card_sn: String,
    pub amount: Decimal,
    pub balance: Decimal,
    pub is_enabled: bool,
    pub user_group_id: Option<GroupId>,
    pub redeemed_user_id: Option<UserId>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
