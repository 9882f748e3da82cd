//! Credential selection.
//!
//! [`Selector::pick`] chooses one upstream credential for a request:
//!
//! 1. Resolve the caller's membership from the `user_id` in the request's [`AccessMetadata`].
//!    Callers whose membership cannot be resolved skip every group check (rate limits still
//!    apply).
//! 2. Deny the request outright when the model's policy excludes the caller.
//! 3. Walk the candidates in the order given and take the first one that is usable, whose
//!    credential group admits the caller, and whose credential group's rate limit admits the
//!    request.
//! 4. Record the billing scope for the chosen credential in the request metadata, where the
//!    quota engine picks it up after the upstream call.
//!
//! Selection is first-eligible-wins. Callers express preference through candidate order.

use std::collections::HashMap;
use std::sync::Arc;

use bon::Builder;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::errors::{Error, Result};
use crate::limits::CredentialGroupRateLimiter;
use crate::membership::MembershipResolver;
use crate::policy::{CredentialAccessPolicy, ModelAccessPolicy, PolicyStore};
use crate::types::{GroupId, Membership, UserId};

/// Metadata key carrying the caller's id.
pub const USER_ID_KEY: &str = "user_id";
/// Metadata key carrying the group the request is billed against.
pub const BILLING_GROUP_KEY: &str = "billing_user_group_id";

/// Lifecycle status of an upstream credential, managed outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Inactive,
    Unusable,
}

impl CredentialStatus {
    pub fn is_usable(self) -> bool {
        matches!(self, CredentialStatus::Active)
    }
}

/// A candidate upstream credential, identified by its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub status: CredentialStatus,
}

impl Credential {
    pub fn new(id: impl Into<String>, status: CredentialStatus) -> Self {
        Self { id: id.into(), status }
    }
}

/// Request-scoped string metadata shared between selection and billing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessMetadata(HashMap<String, String>);

impl AccessMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for an authenticated caller.
    pub fn for_user(user_id: UserId) -> Self {
        let mut meta = Self::new();
        meta.insert(USER_ID_KEY, user_id.to_string());
        meta
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// The caller id. Missing, blank, unparsable and non-positive values are all anonymous.
    pub fn user_id(&self) -> Option<UserId> {
        parse_positive_id(self.get(USER_ID_KEY)?)
    }

    /// The billing group written by the last successful pick, if the request is group-scoped.
    pub fn billing_group_id(&self) -> Option<GroupId> {
        parse_positive_id(self.get(BILLING_GROUP_KEY)?)
    }

    pub fn set_billing_group_id(&mut self, group_id: Option<GroupId>) {
        match group_id {
            Some(id) => self.insert(BILLING_GROUP_KEY, id.to_string()),
            None => {
                self.remove(BILLING_GROUP_KEY);
            }
        }
    }
}

impl From<HashMap<String, String>> for AccessMetadata {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

fn parse_positive_id(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

/// Provider-specific request options, passed through untouched.
pub type SelectOptions = HashMap<String, serde_json::Value>;

/// Picks upstream credentials for callers.
///
/// ```ignore
/// let selector = Selector::builder()
///     .resolver(Arc::new(PgMembershipResolver::new(pool)))
///     .policies(store)
///     .rate_limiter(limiter)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct Selector {
    resolver: Arc<dyn MembershipResolver>,
    policies: Arc<dyn PolicyStore>,
    /// Without a limiter, credential group rate limits are not enforced
    rate_limiter: Option<Arc<CredentialGroupRateLimiter>>,
}

impl Selector {
    /// Pick the first eligible credential from `candidates`.
    ///
    /// On success the billing scope is written to `meta` under [`BILLING_GROUP_KEY`], or removed
    /// when the chosen credential is not group-restricted. On failure `meta` is left untouched.
    #[instrument(skip(self, meta, _options, candidates), fields(candidates = candidates.len()), err)]
    pub async fn pick<'a>(
        &self,
        meta: &mut AccessMetadata,
        provider: &str,
        model: &str,
        _options: &SelectOptions,
        candidates: &'a [Credential],
    ) -> Result<&'a Credential> {
        let membership = match meta.user_id() {
            Some(user_id) => self.resolver.resolve(user_id).await,
            None => None,
        };

        let models = ModelAccessPolicy::new(self.policies.clone());
        if !models.permits(provider, model, membership.as_ref()) {
            metrics::counter!("tenantctl_selector_picks_total", "outcome" => "access_denied").increment(1);
            return Err(Error::AccessDenied {
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }

        match self.first_eligible(membership.as_ref(), candidates) {
            Ok((credential, billing_group)) => {
                meta.set_billing_group_id(billing_group);
                debug!(credential = %credential.id, billing_group, "Selected credential");
                metrics::counter!("tenantctl_selector_picks_total", "outcome" => "selected").increment(1);
                Ok(credential)
            }
            Err(err) => {
                let outcome = if err.is_rate_limited() { "rate_limited" } else { "no_eligible" };
                metrics::counter!("tenantctl_selector_picks_total", "outcome" => outcome).increment(1);
                warn!(provider, model, "{}", err);
                Err(err)
            }
        }
    }

    fn first_eligible<'a>(
        &self,
        membership: Option<&Membership>,
        candidates: &'a [Credential],
    ) -> Result<(&'a Credential, Option<GroupId>)> {
        let credentials = CredentialAccessPolicy::new(self.policies.clone());
        let mut unusable = 0;
        let mut group_restricted = 0;
        let mut rate_limited = 0;

        for credential in candidates {
            if !credential.status.is_usable() {
                debug!(credential = %credential.id, status = ?credential.status, "Skipping unusable credential");
                unusable += 1;
                continue;
            }

            let group = credentials.group_for(credential);
            let restriction = group.as_ref().map(|g| g.restriction.clone()).unwrap_or_default();

            if let Some(membership) = membership
                && !restriction.permits(membership)
            {
                debug!(credential = %credential.id, "Skipping credential restricted to other groups");
                group_restricted += 1;
                continue;
            }

            if let (Some(limiter), Some(group)) = (&self.rate_limiter, &group)
                && !limiter.admit(group.id, group.rate_limit)
            {
                debug!(credential = %credential.id, credential_group = group.id, "Skipping rate-limited credential");
                rate_limited += 1;
                continue;
            }

            let billing_group = membership.and_then(|m| m.billing_scope(&restriction));
            return Ok((credential, billing_group));
        }

        Err(Error::NoEligibleCredential {
            candidates: candidates.len(),
            unusable,
            group_restricted,
            rate_limited,
        })
    }
}
