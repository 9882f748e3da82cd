//! Test utilities for seeding tenants, policies and funding sources (available with the
//! `test-utils` feature).
//!
//! Helpers write straight to the tables so tests can set up state that the crate itself only
//! ever reads. They panic on failure.

use crate::config::{Config, DatabaseConfig, PoolSettings};
use crate::db::models::bills::{BillPeriodType, BillStatus};
use crate::types::{BillId, CredentialGroupId, GroupId, PrepaidCardId, UserId};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use sqlx::types::Json;

pub fn create_test_config() -> Config {
    Config {
        database: DatabaseConfig {
            // Will get overriden by env var
            url: "postgres://localhost/tenantctl_test".to_string(),
            pool: PoolSettings {
                max_connections: 2,
                min_connections: 0,
                ..Default::default()
            },
        },
        ..Default::default()
    }
}

pub async fn create_user_group(pool: &PgPool, name: &str) -> GroupId {
    sqlx::query_scalar("INSERT INTO user_groups (name) VALUES ($1) RETURNING id")
        .bind(name)
        .fetch_one(pool)
        .await
        .expect("Failed to create user group")
}

pub async fn create_test_user(pool: &PgPool, username: &str, access: &[GroupId], billing: &[GroupId]) -> UserId {
    sqlx::query_scalar(
        "INSERT INTO users (username, user_group_ids, bill_user_group_ids) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(username)
    .bind(Json(access))
    .bind(Json(billing))
    .fetch_one(pool)
    .await
    .expect("Failed to create test user")
}

pub async fn create_credential_group(pool: &PgPool, name: &str, allowed: &[GroupId], rate_limit: i32) -> CredentialGroupId {
    sqlx::query_scalar("INSERT INTO credential_groups (name, user_group_ids, rate_limit) VALUES ($1, $2, $3) RETURNING id")
        .bind(name)
        .bind(Json(allowed))
        .bind(rate_limit)
        .fetch_one(pool)
        .await
        .expect("Failed to create credential group")
}

pub async fn create_credential(pool: &PgPool, key: &str, credential_group_id: Option<CredentialGroupId>) {
    sqlx::query("INSERT INTO credentials (key, credential_group_id) VALUES ($1, $2)")
        .bind(key)
        .bind(credential_group_id)
        .execute(pool)
        .await
        .expect("Failed to create credential");
}

pub async fn create_model_policy(pool: &PgPool, provider: &str, model_name: &str, allowed: &[GroupId]) {
    sqlx::query("INSERT INTO model_policies (provider, model_name, user_group_ids) VALUES ($1, $2, $3)")
        .bind(provider)
        .bind(model_name)
        .bind(Json(allowed))
        .execute(pool)
        .await
        .expect("Failed to create model policy");
}

/// A paid, enabled bill whose period started an hour ago and runs for another 30 days.
#[derive(Debug, Clone)]
pub struct BillSeed {
    pub user_id: UserId,
    pub user_group_id: Option<GroupId>,
    pub period_type: BillPeriodType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_quota: Decimal,
    pub left_quota: Decimal,
    pub daily_quota: Decimal,
    pub status: BillStatus,
    pub is_enabled: bool,
}

impl BillSeed {
    pub fn new(user_id: UserId, user_group_id: Option<GroupId>, quota: Decimal) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            user_group_id,
            period_type: BillPeriodType::Monthly,
            period_start: now - Duration::hours(1),
            period_end: now + Duration::days(30),
            total_quota: quota,
            left_quota: quota,
            daily_quota: Decimal::ZERO,
            status: BillStatus::Paid,
            is_enabled: true,
        }
    }
}

pub async fn create_bill(pool: &PgPool, seed: BillSeed) -> BillId {
    sqlx::query_scalar(
        r#"
        INSERT INTO bills (
            user_id, user_group_id, period_type, period_start, period_end,
            total_quota, left_quota, daily_quota, status, is_enabled
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(seed.user_id)
    .bind(seed.user_group_id)
    .bind(seed.period_type)
    .bind(seed.period_start)
    .bind(seed.period_end)
    .bind(seed.total_quota)
    .bind(seed.left_quota)
    .bind(seed.daily_quota)
    .bind(seed.status)
    .bind(seed.is_enabled)
    .fetch_one(pool)
    .await
    .expect("Failed to create bill")
}

/// An enabled, non-expiring card. Cards with a redeeming user were redeemed a minute ago.
#[derive(Debug, Clone)]
pub struct CardSeed {
    pub card_sn: String,
    pub redeemed_user_id: Option<UserId>,
    pub user_group_id: Option<GroupId>,
    pub amount: Decimal,
    pub balance: Decimal,
    pub is_enabled: bool,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CardSeed {
    pub fn new(card_sn: &str, redeemed_user_id: Option<UserId>, user_group_id: Option<GroupId>, balance: Decimal) -> Self {
        Self {
            card_sn: card_sn.to_string(),
            redeemed_user_id,
            user_group_id,
            amount: balance,
            balance,
            is_enabled: true,
            redeemed_at: redeemed_user_id.map(|_| Utc::now() - Duration::minutes(1)),
            expires_at: None,
        }
    }
}

pub async fn create_prepaid_card(pool: &PgPool, seed: CardSeed) -> PrepaidCardId {
    sqlx::query_scalar(
        r#"
        INSERT INTO prepaid_cards (
            name, card_sn, amount, balance, is_enabled,
            user_group_id, redeemed_user_id, redeemed_at, expires_at
        )
        VALUES ($1, $1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(&seed.card_sn)
    .bind(seed.amount)
    .bind(seed.balance)
    .bind(seed.is_enabled)
    .bind(seed.user_group_id)
    .bind(seed.redeemed_user_id)
    .bind(seed.redeemed_at)
    .bind(seed.expires_at)
    .fetch_one(pool)
    .await
    .expect("Failed to create prepaid card")
}
