//! Model and credential access policies.
//!
//! Policies are administered elsewhere and cached in memory as an immutable [`PolicySnapshot`].
//! The selector only ever reads them through the [`PolicyStore`] trait; whoever owns the cache
//! (see [`crate::sync`]) swaps in a fresh snapshot when policies change.
//!
//! - [`ModelAccessPolicy`]: `(provider, model)` to the groups allowed to request that model.
//!   Provider matching is case-insensitive; model names match exactly (canonical names, not
//!   request-time aliases).
//! - [`CredentialAccessPolicy`]: credential to the restriction of its owning credential group.
//!   A credential without a resolvable group is unrestricted and not rate limited.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use sqlx::PgConnection;
use tracing::{debug, instrument};

use crate::db::handlers::Policies;
use crate::selector::Credential;
use crate::types::{CredentialGroupId, GroupSet, Membership, Restriction};

/// Access and rate-limit settings shared by every credential in a credential group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialGroupPolicy {
    pub id: CredentialGroupId,
    pub name: String,
    pub is_default: bool,
    pub restriction: Restriction,
    /// Requests per rate-limit window, 0 = unlimited
    pub rate_limit: u32,
}

/// Read interface over the policy cache.
pub trait PolicyStore: Send + Sync {
    /// Groups allowed to request `model` from `provider`. `None` when no policy exists.
    fn model_groups(&self, provider: &str, model: &str) -> Option<GroupSet>;

    /// The credential group owning the credential with `credential_key`.
    fn credential_group(&self, credential_key: &str) -> Option<CredentialGroupPolicy>;
}

fn model_key(provider: &str, model: &str) -> (String, String) {
    (provider.trim().to_lowercase(), model.to_string())
}

/// An immutable view of all access policies at one point in time.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    models: HashMap<(String, String), GroupSet>,
    credential_groups: HashMap<CredentialGroupId, CredentialGroupPolicy>,
    credentials: HashMap<String, CredentialGroupId>,
}

impl PolicySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_policy(mut self, provider: &str, model: &str, groups: GroupSet) -> Self {
        self.models.insert(model_key(provider, model), groups);
        self
    }

    pub fn with_credential_group(mut self, group: CredentialGroupPolicy) -> Self {
        self.credential_groups.insert(group.id, group);
        self
    }

    pub fn with_credential(mut self, key: &str, group_id: CredentialGroupId) -> Self {
        self.credentials.insert(key.to_string(), group_id);
        self
    }

    pub fn model_policy_count(&self) -> usize {
        self.models.len()
    }

    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Load every enabled policy from the database.
    #[instrument(skip(conn), err)]
    pub async fn load(conn: &mut PgConnection) -> crate::db::errors::Result<Self> {
        let mut repo = Policies::new(conn);
        let mut snapshot = PolicySnapshot::new();

        for policy in repo.list_enabled_model_policies().await? {
            snapshot = snapshot.with_model_policy(&policy.provider, &policy.model_name, policy.user_group_ids);
        }
        for group in repo.list_credential_groups().await? {
            snapshot = snapshot.with_credential_group(CredentialGroupPolicy {
                id: group.id,
                name: group.name,
                is_default: group.is_default,
                restriction: Restriction::from(group.user_group_ids),
                rate_limit: u32::try_from(group.rate_limit).unwrap_or(0),
            });
        }
        for binding in repo.list_credential_bindings().await? {
            if let Some(group_id) = binding.credential_group_id {
                snapshot = snapshot.with_credential(&binding.key, group_id);
            }
        }

        debug!(
            models = snapshot.model_policy_count(),
            credentials = snapshot.credential_count(),
            "Loaded policy snapshot"
        );
        Ok(snapshot)
    }
}

impl PolicyStore for PolicySnapshot {
    fn model_groups(&self, provider: &str, model: &str) -> Option<GroupSet> {
        self.models.get(&model_key(provider, model)).cloned()
    }

    fn credential_group(&self, credential_key: &str) -> Option<CredentialGroupPolicy> {
        let group_id = self.credentials.get(credential_key)?;
        self.credential_groups.get(group_id).cloned()
    }
}

/// A [`PolicyStore`] whose snapshot can be replaced atomically while readers keep going.
#[derive(Debug)]
pub struct SnapshotPolicyStore {
    current: ArcSwap<PolicySnapshot>,
}

impl SnapshotPolicyStore {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Replace the cached snapshot. Lookups already in flight finish against the old one.
    pub fn store(&self, snapshot: PolicySnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }
}

impl Default for SnapshotPolicyStore {
    fn default() -> Self {
        Self::new(PolicySnapshot::default())
    }
}

impl PolicyStore for SnapshotPolicyStore {
    fn model_groups(&self, provider: &str, model: &str) -> Option<GroupSet> {
        self.current.load().model_groups(provider, model)
    }

    fn credential_group(&self, credential_key: &str) -> Option<CredentialGroupPolicy> {
        self.current.load().credential_group(credential_key)
    }
}

/// Which callers may request a given model.
#[derive(Clone)]
pub struct ModelAccessPolicy {
    store: Arc<dyn PolicyStore>,
}

impl ModelAccessPolicy {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    /// A missing policy and an empty group list both mean unrestricted.
    pub fn lookup(&self, provider: &str, model: &str) -> Restriction {
        Restriction::from(self.store.model_groups(provider, model))
    }

    /// Whether a caller may request the model. Callers with unknown membership are not filtered.
    pub fn permits(&self, provider: &str, model: &str, membership: Option<&Membership>) -> bool {
        match membership {
            None => true,
            Some(membership) => self.lookup(provider, model).permits(membership),
        }
    }

    /// Keep only the models a caller may request, preserving order. `key` extracts the
    /// `(provider, model)` pair from each entry.
    pub fn filter_models<T, F>(&self, models: Vec<T>, membership: Option<&Membership>, key: F) -> Vec<T>
    where
        F: Fn(&T) -> (&str, &str),
    {
        if membership.is_none() {
            return models;
        }
        models
            .into_iter()
            .filter(|entry| {
                let (provider, model) = key(entry);
                self.permits(provider, model, membership)
            })
            .collect()
    }
}

/// Which callers may use a given credential, via its credential group.
#[derive(Clone)]
pub struct CredentialAccessPolicy {
    store: Arc<dyn PolicyStore>,
}

impl CredentialAccessPolicy {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    pub fn group_for(&self, credential: &Credential) -> Option<CredentialGroupPolicy> {
        self.store.credential_group(&credential.id)
    }

    pub fn restriction_for(&self, credential: &Credential) -> Restriction {
        self.group_for(credential).map(|g| g.restriction).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::CredentialStatus;
    use crate::test_utils::{create_credential, create_credential_group, create_model_policy, create_user_group};
    use sqlx::PgPool;

    fn set(ids: &[i64]) -> GroupSet {
        ids.iter().copied().collect()
    }

    fn group(id: CredentialGroupId, allowed: &[i64], rate_limit: u32) -> CredentialGroupPolicy {
        CredentialGroupPolicy {
            id,
            name: format!("ag-{id}"),
            is_default: false,
            restriction: Restriction::from(set(allowed)),
            rate_limit,
        }
    }

    fn store(snapshot: PolicySnapshot) -> Arc<dyn PolicyStore> {
        Arc::new(snapshot)
    }

    #[test]
    fn test_model_lookup_is_case_insensitive_on_provider_only() {
        let policy = ModelAccessPolicy::new(store(PolicySnapshot::new().with_model_policy("OpenAI", "gpt-4", set(&[1]))));

        assert!(policy.lookup("openai", "gpt-4").is_restricted());
        assert!(policy.lookup(" OPENAI ", "gpt-4").is_restricted());
        assert_eq!(policy.lookup("openai", "GPT-4"), Restriction::Unrestricted);
        assert_eq!(policy.lookup("openai", " gpt-4"), Restriction::Unrestricted);
        assert_eq!(policy.lookup("openai", "gpt-4 "), Restriction::Unrestricted);
        assert_eq!(policy.lookup("gemini", "gpt-4"), Restriction::Unrestricted);
    }

    #[test]
    fn test_empty_model_policy_is_open() {
        let policy = ModelAccessPolicy::new(store(PolicySnapshot::new().with_model_policy("openai", "gpt-4", GroupSet::new())));
        assert_eq!(policy.lookup("openai", "gpt-4"), Restriction::Unrestricted);
    }

    #[test]
    fn test_filter_models_keeps_permitted_in_order() {
        let policy = ModelAccessPolicy::new(store(
            PolicySnapshot::new()
                .with_model_policy("openai", "gpt-4", set(&[1]))
                .with_model_policy("openai", "o1", set(&[2])),
        ));
        let models = vec![
            ("openai", "gpt-4"),
            ("openai", "o1"),
            ("openai", "gpt-3.5"),
        ];
        let member_of_1 = Membership::new(set(&[1]), GroupSet::new());

        let visible = policy.filter_models(models.clone(), Some(&member_of_1), |m| (m.0, m.1));
        assert_eq!(visible, vec![("openai", "gpt-4"), ("openai", "gpt-3.5")]);

        let anonymous = policy.filter_models(models.clone(), None, |m| (m.0, m.1));
        assert_eq!(anonymous.len(), 3);
    }

    #[test]
    fn test_credential_restriction_resolves_through_group() {
        let policy = CredentialAccessPolicy::new(store(
            PolicySnapshot::new()
                .with_credential_group(group(7, &[1, 2], 3))
                .with_credential("auth-1", 7)
                .with_credential("auth-dangling", 99),
        ));

        let bound = Credential::new("auth-1", CredentialStatus::Active);
        assert_eq!(policy.restriction_for(&bound), Restriction::from(set(&[1, 2])));
        assert_eq!(policy.group_for(&bound).unwrap().rate_limit, 3);

        let dangling = Credential::new("auth-dangling", CredentialStatus::Active);
        assert_eq!(policy.restriction_for(&dangling), Restriction::Unrestricted);

        let unknown = Credential::new("auth-unknown", CredentialStatus::Active);
        assert!(policy.group_for(&unknown).is_none());
    }

    #[test]
    fn test_snapshot_store_swaps_atomically() {
        let store = Arc::new(SnapshotPolicyStore::default());
        let policy = ModelAccessPolicy::new(store.clone());
        assert_eq!(policy.lookup("openai", "gpt-4"), Restriction::Unrestricted);

        store.store(PolicySnapshot::new().with_model_policy("openai", "gpt-4", set(&[5])));
        assert_eq!(policy.lookup("openai", "gpt-4"), Restriction::from(set(&[5])));
        assert_eq!(store.snapshot().model_policy_count(), 1);
    }

    #[sqlx::test]
    async fn test_load_snapshot_from_database(pool: PgPool) {
        let g1 = create_user_group(&pool, "g1").await;
        create_model_policy(&pool, "OpenAI", "gpt-4", &[g1]).await;
        let ag = create_credential_group(&pool, "ag", &[g1], 10).await;
        let open = create_credential_group(&pool, "open", &[], 0).await;
        create_credential(&pool, "auth-1", Some(ag)).await;
        create_credential(&pool, "auth-2", Some(open)).await;
        create_credential(&pool, "auth-3", None).await;

        let mut conn = pool.acquire().await.unwrap();
        let snapshot = PolicySnapshot::load(&mut conn).await.unwrap();

        assert_eq!(snapshot.model_groups("openai", "gpt-4"), Some(set(&[g1])));
        assert_eq!(snapshot.credential_count(), 2);

        let restricted = snapshot.credential_group("auth-1").unwrap();
        assert_eq!(restricted.restriction, Restriction::from(set(&[g1])));
        assert_eq!(restricted.rate_limit, 10);

        assert_eq!(snapshot.credential_group("auth-2").unwrap().restriction, Restriction::Unrestricted);
        assert!(snapshot.credential_group("auth-3").is_none());
    }
}
