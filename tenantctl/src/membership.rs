//! Caller group membership resolution.
//!
//! [`MembershipResolver::resolve`] maps a caller identity to its access and billing group sets.
//! `None` means "membership unknown": unknown or zero ids, and store failures. Such callers go
//! through the anonymous path where no group filtering applies, so a failure here degrades to
//! "unrestricted" and is only logged.

use crate::db::handlers::Users;
use crate::types::{Membership, UserId};
use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use tracing::{instrument, warn};

#[async_trait]
pub trait MembershipResolver: Send + Sync {
    async fn resolve(&self, user_id: UserId) -> Option<Membership>;
}

/// Resolves memberships from the `users` table on every call.
///
/// No caching: a membership change is visible to the next request that resolves it.
#[derive(Debug, Clone)]
pub struct PgMembershipResolver {
    db: PgPool,
}

impl PgMembershipResolver {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MembershipResolver for PgMembershipResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, user_id: UserId) -> Option<Membership> {
        if user_id <= 0 {
            return None;
        }
        let mut conn = match self.db.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to acquire connection for membership lookup: {}", e);
                return None;
            }
        };
        resolve_with(&mut conn, user_id).await
    }
}

/// Resolve on an existing connection, e.g. inside the caller's transaction so that membership
/// writes made earlier in that transaction are visible.
pub async fn resolve_with(conn: &mut PgConnection, user_id: UserId) -> Option<Membership> {
    if user_id <= 0 {
        return None;
    }
    match Users::new(conn).get_membership(user_id).await {
        Ok(membership) => membership.map(Membership::from),
        Err(e) => {
            warn!(user_id, "Membership lookup failed, treating caller as unrestricted: {}", e);
            None
        }
    }
}
