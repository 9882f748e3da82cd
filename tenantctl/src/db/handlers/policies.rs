//! Database repository for model and credential access policies.
//!
//! Policies are maintained by administrative tooling outside this crate. This repository only
//! reads them, in bulk, to build a [`crate::policy::PolicySnapshot`].

use crate::db::{
    errors::Result,
    models::policies::{CredentialBindingDBResponse, CredentialGroupDBResponse, ModelPolicyDBResponse},
};
use crate::types::{CredentialGroupId, GroupSet};
use sqlx::{FromRow, PgConnection, types::Json};
use tracing::instrument;

// Database entity models
#[derive(Debug, Clone, FromRow)]
struct ModelPolicy {
    pub id: i64,
    pub provider: String,
    pub model_name: String,
    pub is_enabled: bool,
    pub user_group_ids: Json<GroupSet>,
}

impl From<ModelPolicy> for ModelPolicyDBResponse {
    fn from(policy: ModelPolicy) -> Self {
        Self {
            id: policy.id,
            provider: policy.provider,
            model_name: policy.model_name,
            is_enabled: policy.is_enabled,
            user_group_ids: policy.user_group_ids.0,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct CredentialGroup {
    pub id: CredentialGroupId,
    pub name: String,
    pub is_default: bool,
    pub rate_limit: i32,
    pub user_group_ids: Json<GroupSet>,
}

impl From<CredentialGroup> for CredentialGroupDBResponse {
    fn from(group: CredentialGroup) -> Self {
        Self {
            id: group.id,
            name: group.name,
            is_default: group.is_default,
            rate_limit: group.rate_limit,
            user_group_ids: group.user_group_ids.0,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct CredentialBinding {
    pub key: String,
    pub credential_group_id: Option<CredentialGroupId>,
}

pub struct Policies<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Policies<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// All enabled model policies. Disabled rows impose no restriction, so they are skipped.
    #[instrument(skip(self), err)]
    pub async fn list_enabled_model_policies(&mut self) -> Result<Vec<ModelPolicyDBResponse>> {
        let policies = sqlx::query_as::<_, ModelPolicy>(
            r#"
            SELECT id, provider, model_name, is_enabled, user_group_ids
            FROM model_policies
            WHERE is_enabled = TRUE
            ORDER BY id
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(policies.into_iter().map(ModelPolicyDBResponse::from).collect())
    }

    #[instrument(skip(self), err)]
    pub async fn list_credential_groups(&mut self) -> Result<Vec<CredentialGroupDBResponse>> {
        let groups = sqlx::query_as::<_, CredentialGroup>(
            r#"
            SELECT id, name, is_default, rate_limit, user_group_ids
            FROM credential_groups
            ORDER BY id
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(groups.into_iter().map(CredentialGroupDBResponse::from).collect())
    }

    #[instrument(skip(self), err)]
    pub async fn list_credential_bindings(&mut self) -> Result<Vec<CredentialBindingDBResponse>> {
        let bindings = sqlx::query_as::<_, CredentialBinding>(
            r#"
            SELECT key, credential_group_id
            FROM credentials
            ORDER BY id
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(bindings
            .into_iter()
            .map(|b| CredentialBindingDBResponse {
                key: b.key,
                credential_group_id: b.credential_group_id,
            })
            .collect())
    }
}
