//! Database models for caller group memberships.

use crate::types::{GroupSet, Membership, UserId};

/// Database response for a user's two group memberships
#[derive(Debug, Clone)]
pub struct UserMembershipDBResponse {
    pub id: UserId,
    /// Access groups (`users.user_group_ids`)
    pub user_group_ids: GroupSet,
    /// Billing groups (`users.bill_user_group_ids`)
    pub bill_user_group_ids: GroupSet,
}

impl From<UserMembershipDBResponse> for Membership {
    fn from(row: UserMembershipDBResponse) -> Self {
        Membership::new(row.user_group_ids, row.bill_user_group_ids)
    }
}
