//! Common type definitions and group-scoping primitives.
//!
//! This module defines:
//! - Type aliases for entity IDs (UserId, GroupId, etc.)
//! - [`GroupSet`]: a deduplicated set of tenant group ids
//! - [`Restriction`]: an explicit "open to everyone" vs "open to these groups" policy value
//! - [`Membership`]: a caller's access and billing group sets
//!
//! # ID Types
//!
//! All entity IDs are `BIGSERIAL` keys wrapped in type aliases:
//!
//! - [`UserId`]: Caller identity
//! - [`GroupId`]: Tenant (user) group identifier
//! - [`CredentialGroupId`]: Credential group identifier
//! - [`BillId`]: Subscription quota record identifier
//! - [`PrepaidCardId`]: Prepaid balance identifier
//!
//! # Restrictions
//!
//! Policy rows store their allowed groups as a (possibly empty) list. An empty list means
//! "unrestricted", which is easy to get wrong when the list is also used to mean "no
//! membership" on the caller side. Policy lookups therefore convert stored lists into
//! [`Restriction`] immediately, and membership checks only ever go through
//! [`Restriction::permits`].

use serde::{Deserialize, Deserializer, Serialize};

// Type aliases for IDs
pub type UserId = i64;
pub type GroupId = i64;
pub type CredentialGroupId = i64;
pub type BillId = i64;
pub type PrepaidCardId = i64;

/// A deduplicated set of tenant group ids.
///
/// Ids keep the order in which they were first inserted, which matters when picking "the first
/// matching billing group". Equality ignores order. Non-positive ids are never members.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct GroupSet(Vec<GroupId>);

impl GroupSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Inserts `id`, returning `false` if it was already present or is not a valid group id.
    pub fn insert(&mut self, id: GroupId) -> bool {
        if id <= 0 || self.0.contains(&id) {
            return false;
        }
        self.0.push(id);
        true
    }

    pub fn contains(&self, id: GroupId) -> bool {
        self.0.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Ids in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.0.iter().copied()
    }

    /// The first id, if any.
    pub fn primary(&self) -> Option<GroupId> {
        self.0.first().copied()
    }

    pub fn intersects(&self, other: &GroupSet) -> bool {
        self.iter().any(|id| other.contains(id))
    }
}

impl FromIterator<GroupId> for GroupSet {
    fn from_iter<I: IntoIterator<Item = GroupId>>(iter: I) -> Self {
        let mut set = GroupSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl From<Vec<GroupId>> for GroupSet {
    fn from(ids: Vec<GroupId>) -> Self {
        ids.into_iter().collect()
    }
}

impl PartialEq for GroupSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|id| other.contains(id))
    }
}

impl Eq for GroupSet {}

/// Shapes accepted for a stored group id list.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredGroupIds {
    List(Vec<Option<GroupId>>),
    Single(GroupId),
}

impl<'de> Deserialize<'de> for GroupSet {
    /// Accepts `[1, 2]`, `[1, null, 2]`, a bare `1`, or `null`. Null, zero and duplicate ids
    /// are dropped.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stored = Option::<StoredGroupIds>::deserialize(deserializer)?;
        Ok(match stored {
            None => GroupSet::new(),
            Some(StoredGroupIds::Single(id)) => std::iter::once(id).collect(),
            Some(StoredGroupIds::List(ids)) => ids.into_iter().flatten().collect(),
        })
    }
}

/// Which callers a model or credential is open to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Restriction {
    /// Open to every caller.
    #[default]
    Unrestricted,
    /// Open only to callers belonging to at least one of these groups. Never empty.
    Restricted(GroupSet),
}

impl Restriction {
    /// Whether a caller with `membership` may use the restricted resource.
    pub fn permits(&self, membership: &Membership) -> bool {
        match self {
            Restriction::Unrestricted => true,
            Restriction::Restricted(allowed) => membership.intersects(allowed),
        }
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self, Restriction::Restricted(_))
    }

    pub fn groups(&self) -> Option<&GroupSet> {
        match self {
            Restriction::Unrestricted => None,
            Restriction::Restricted(groups) => Some(groups),
        }
    }
}

impl From<GroupSet> for Restriction {
    fn from(groups: GroupSet) -> Self {
        if groups.is_empty() {
            Restriction::Unrestricted
        } else {
            Restriction::Restricted(groups)
        }
    }
}

impl From<Option<GroupSet>> for Restriction {
    fn from(groups: Option<GroupSet>) -> Self {
        groups.map(Restriction::from).unwrap_or_default()
    }
}

/// A caller's two independent group memberships.
///
/// Access checks test the union of both sets. When choosing which group to bill, billing groups
/// take precedence over access groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub access: GroupSet,
    pub billing: GroupSet,
}

impl Membership {
    pub fn new(access: GroupSet, billing: GroupSet) -> Self {
        Self { access, billing }
    }

    /// Whether `id` is in either membership set.
    pub fn contains(&self, id: GroupId) -> bool {
        self.access.contains(id) || self.billing.contains(id)
    }

    /// Whether any of `groups` is in either membership set.
    pub fn intersects(&self, groups: &GroupSet) -> bool {
        groups.iter().any(|id| self.contains(id))
    }

    /// The group to charge when using a resource guarded by `restriction`.
    ///
    /// Returns the first billing group the restriction allows, falling back to the first
    /// allowed access group. Unrestricted resources are never group-scoped.
    pub fn billing_scope(&self, restriction: &Restriction) -> Option<GroupId> {
        let allowed = restriction.groups()?;
        self.billing
            .iter()
            .find(|id| allowed.contains(*id))
            .or_else(|| self.access.iter().find(|id| allowed.contains(*id)))
    }
}
