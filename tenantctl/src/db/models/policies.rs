//! Database models for model and credential access policies.

use crate::types::{CredentialGroupId, GroupSet};

/// Database response for a model access policy
#[derive(Debug, Clone)]
pub struct ModelPolicyDBResponse {
    pub id: i64,
    pub provider: String,
    pub model_name: String,
    pub is_enabled: bool,
    pub user_group_ids: GroupSet,
}

/// Database response for a credential group
#[derive(Debug, Clone)]
pub struct CredentialGroupDBResponse {
    pub id: CredentialGroupId,
    pub name: String,
    pub is_default: bool,
    /// Requests per rate-limit window, 0 = unlimited
    pub rate_limit: i32,
    pub user_group_ids: GroupSet,
}

/// Which credential group a credential key belongs to
#[derive(Debug, Clone)]
pub struct CredentialBindingDBResponse {
    pub key: String,
    pub credential_group_id: Option<CredentialGroupId>,
}
