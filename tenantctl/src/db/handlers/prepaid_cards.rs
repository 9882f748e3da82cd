//! Database repository for redeemed prepaid balances.

use crate::db::{errors::Result, models::prepaid_cards::PrepaidCardDBResponse};
use crate::types::{GroupId, PrepaidCardId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgConnection};
use tracing::instrument;

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct PrepaidCard {
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

impl From<PrepaidCard> for PrepaidCardDBResponse {
    fn from(card: PrepaidCard) -> Self {
        Self {
            id: card.id,
            name: card.name,
            card_sn: card.card_sn,
            amount: card.amount,
            balance: card.balance,
            is_enabled: card.is_enabled,
            user_group_id: card.user_group_id,
            redeemed_user_id: card.redeemed_user_id,
            redeemed_at: card.redeemed_at,
            expires_at: card.expires_at,
            created_at: card.created_at,
        }
    }
}

const CARD_COLUMNS: &str =
    "id, name, card_sn, amount, balance, is_enabled, user_group_id, redeemed_user_id, redeemed_at, expires_at, created_at";

pub struct PrepaidCards<'c> {
    db: &'c mut PgConnection,
}

impl<'c> PrepaidCards<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_id(&mut self, id: PrepaidCardId) -> Result<Option<PrepaidCardDBResponse>> {
        let card = sqlx::query_as::<_, PrepaidCard>(&format!("SELECT {CARD_COLUMNS} FROM prepaid_cards WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(card.map(PrepaidCardDBResponse::from))
    }

    /// Cards redeemed by the user that could cover `amount`, oldest redemption first.
    ///
    /// Same exact-group rule as bills: `None` only matches cards with no group.
    #[instrument(skip(self), err)]
    pub async fn list_eligible(
        &mut self,
        user_id: UserId,
        user_group_id: Option<GroupId>,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<PrepaidCardDBResponse>> {
        let cards = sqlx::query_as::<_, PrepaidCard>(&format!(
            r#"
            SELECT {CARD_COLUMNS}
            FROM prepaid_cards
            WHERE redeemed_user_id = $1
              AND user_group_id IS NOT DISTINCT FROM $2::BIGINT
              AND is_enabled = TRUE
              AND (expires_at IS NULL OR expires_at > $3)
              AND balance >= $4
            ORDER BY redeemed_at ASC NULLS LAST, id ASC
            "#
        ))
        .bind(user_id)
        .bind(user_group_id)
        .bind(now)
        .bind(amount)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(cards.into_iter().map(PrepaidCardDBResponse::from).collect())
    }

    /// Atomically take `amount` from a card's balance, returning what is left.
    /// `None` means the card can no longer cover it.
    #[instrument(skip(self), err)]
    pub async fn try_deduct(&mut self, id: PrepaidCardId, amount: Decimal, now: DateTime<Utc>) -> Result<Option<Decimal>> {
        let remaining = sqlx::query_scalar::<_, Decimal>(
            r#"
            UPDATE prepaid_cards SET
                balance = balance - $2
            WHERE id = $1
              AND is_enabled = TRUE
              AND (expires_at IS NULL OR expires_at > $3)
              AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(id)
        .bind(amount)
        .bind(now)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(remaining)
    }
}
