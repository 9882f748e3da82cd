//! Database repository for caller group memberships.

use crate::db::{errors::Result, models::users::UserMembershipDBResponse};
use crate::types::{GroupSet, UserId};
use sqlx::{FromRow, PgConnection, types::Json};
use tracing::instrument;

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct UserMembership {
    pub id: UserId,
    pub user_group_ids: Json<GroupSet>,
    pub bill_user_group_ids: Json<GroupSet>,
}

impl From<UserMembership> for UserMembershipDBResponse {
    fn from(user: UserMembership) -> Self {
        Self {
            id: user.id,
            user_group_ids: user.user_group_ids.0,
            bill_user_group_ids: user.bill_user_group_ids.0,
        }
    }
}

pub struct Users<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Users<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Load a user's access and billing groups. Returns `None` for unknown users.
    #[instrument(skip(self), err)]
    pub async fn get_membership(&mut self, user_id: UserId) -> Result<Option<UserMembershipDBResponse>> {
        let user = sqlx::query_as::<_, UserMembership>(
            r#"
            SELECT id, user_group_ids, bill_user_group_ids
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(user.map(UserMembershipDBResponse::from))
    }
}
