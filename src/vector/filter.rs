//! Search filter: the permission block plus generic metadata predicates.
//!
//! Mirrors `HNSWNode.satisfies_filters` from the chunking/search service's
//! original implementation, split into a permission sub-check (`spec.md`
//! §4.1.1) evaluated first, and a small operator language for everything else.

use crate::types::{AccessLevel, GroupId, Metadata, UserId, UserRole, Value};

/// Operators available for generic (non-permission) metadata predicates.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterOp {
    /// Actual value must equal this scalar.
    Eq(Value),
    /// Actual value must not equal this scalar.
    Ne(Value),
    /// Actual value must be a member of this list.
    In(Vec<Value>),
    /// Actual numeric value must be `>=` this.
    Gte(f64),
    /// Actual numeric value must be `<=` this.
    Lte(f64),
}

impl FilterOp {
    fn matches(&self, actual: &Value) -> bool {
        match self {
            FilterOp::Eq(expected) => actual == expected,
            FilterOp::Ne(expected) => actual != expected,
            FilterOp::In(list) => list.contains(actual),
            FilterOp::Gte(min) => actual.as_f64().is_some_and(|n| n >= *min),
            FilterOp::Lte(max) => actual.as_f64().is_some_and(|n| n <= *max),
        }
    }
}

/// A single generic-key predicate. `spec.md` §4.1: scalar = equality, list =
/// membership, mapping = operator map (`$in`/`$gte`/`$lte`/`$ne`).
#[derive(Clone, Debug, PartialEq)]
pub enum GenericPredicate {
    /// Node's value at this key must equal this scalar exactly.
    Equals(Value),
    /// Node's value at this key must be a member of this list.
    MemberOf(Vec<Value>),
    /// Node's value at this key must satisfy every listed operator.
    Ops(Vec<FilterOp>),
}

impl GenericPredicate {
    fn matches(&self, actual: &Value) -> bool {
        match self {
            GenericPredicate::Equals(expected) => actual == expected,
            GenericPredicate::MemberOf(list) => list.contains(actual),
            GenericPredicate::Ops(ops) => ops.iter().all(|op| op.matches(actual)),
        }
    }
}

/// The `permissions` sub-structure of a search filter (`spec.md` §4.1.1 / §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionContext {
    /// Caller's identity, used by the `RESTRICTED` access level.
    pub user_id: UserId,
    /// Caller's role, used by the `MANAGERS`/`ADMINS` access levels and the
    /// unconditional `ADMIN` bypass.
    pub user_role: UserRole,
    /// Groups the caller belongs to, used by the `GROUP` access level.
    pub user_group_ids: Vec<GroupId>,
}

impl PermissionContext {
    /// Convenience constructor for an admin caller with no group memberships.
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            user_role: UserRole::Admin,
            user_group_ids: Vec::new(),
        }
    }

    /// Convenience constructor for a member caller.
    pub fn member(user_id: impl Into<String>, user_group_ids: Vec<GroupId>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            user_role: UserRole::Member,
            user_group_ids,
        }
    }
}

/// A full query filter: an optional permission context plus generic predicates.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    /// When `None`, the permission block is skipped entirely (used internally
    /// by top-layer/`ef=1` descents, which always pass `filter=None`).
    pub permissions: Option<PermissionContext>,
    /// Generic (non-permission) key predicates, ANDed together.
    pub generic: Vec<(String, GenericPredicate)>,
}

impl Filter {
    /// Returns a filter with no permission context and no generic predicates
    /// — matches every non-deleted node. Used for `ef=1` descents.
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns true iff `self` has no permission context and no generic predicates.
    pub fn is_empty(&self) -> bool {
        self.permissions.is_none() && self.generic.is_empty()
    }

    /// Evaluates the permission block against a node's metadata, per `spec.md`
    /// §4.1.1's evaluation order. Returns `true` (pass) when there is no
    /// permission context at all.
    pub fn permission_passes(&self, metadata: &Metadata) -> bool {
        let Some(ctx) = &self.permissions else {
            return true;
        };
        permission_passes(ctx, metadata)
    }

    /// Evaluates every generic predicate against a node's metadata. A missing
    /// key is a deny, per `spec.md` §4.1.
    pub fn generic_passes(&self, metadata: &Metadata) -> bool {
        self.generic
            .iter()
            .all(|(key, pred)| match metadata.get(key) {
                Some(actual) => pred.matches(actual),
                None => false,
            })
    }

    /// Full predicate: permission block AND every generic predicate.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.permission_passes(metadata) && self.generic_passes(metadata)
    }
}

/// Standalone permission-block evaluation, shared by [`Filter::permission_passes`]
/// and the search service's defensive `check_permissions` second check
/// (`spec.md` §4.5).
pub fn permission_passes(ctx: &PermissionContext, metadata: &Metadata) -> bool {
    if ctx.user_role == UserRole::Admin {
        return true;
    }

    let access_level = match metadata.get("accessLevel").and_then(Value::as_str) {
        Some("PUBLIC") => AccessLevel::Public,
        Some("GROUP") => AccessLevel::Group,
        Some("MANAGERS") => AccessLevel::Managers,
        Some("ADMINS") => AccessLevel::Admins,
        Some("RESTRICTED") => AccessLevel::Restricted,
        _ => return false,
    };

    match access_level {
        AccessLevel::Public => true,
        AccessLevel::Group => {
            let group_id = metadata.get("groupId").and_then(Value::as_str);
            match group_id {
                Some(gid) if !gid.is_empty() => {
                    ctx.user_group_ids.iter().any(|g| g.as_str() == gid)
                }
                _ => false,
            }
        }
        AccessLevel::Managers => matches!(ctx.user_role, UserRole::Manager | UserRole::Admin),
        AccessLevel::Admins => ctx.user_role == UserRole::Admin,
        AccessLevel::Restricted => {
            let restricted_to = metadata.get("restrictedToUsers").and_then(Value::as_list);
            match restricted_to {
                Some(list) => list
                    .iter()
                    .any(|v| v.as_str() == Some(ctx.user_id.as_str())),
                None => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn md(access: &str, group: Option<&str>, restricted: Option<Vec<&str>>) -> Metadata {
        let mut m = BTreeMap::new();
        m.insert("accessLevel".to_string(), Value::string(access));
        if let Some(g) = group {
            m.insert("groupId".to_string(), Value::string(g));
        }
        if let Some(r) = restricted {
            m.insert("restrictedToUsers".to_string(), r.into());
        }
        m
    }

    #[test]
    fn admin_bypasses_permission_block_unconditionally() {
        let ctx = PermissionContext::admin("u1");
        let metadata = md("ADMINS", None, None);
        assert!(permission_passes(&ctx, &metadata));
    }

    #[test]
    fn public_passes_for_any_member() {
        let ctx = PermissionContext::member("u1", vec![]);
        assert!(permission_passes(&ctx, &md("PUBLIC", None, None)));
    }

    #[test]
    fn group_requires_membership() {
        let ctx = PermissionContext::member("u1", vec![GroupId::new("g1")]);
        assert!(permission_passes(&ctx, &md("GROUP", Some("g1"), None)));
        assert!(!permission_passes(&ctx, &md("GROUP", Some("g2"), None)));
        assert!(!permission_passes(&ctx, &md("GROUP", None, None)));
    }

    #[test]
    fn managers_requires_manager_or_admin_role() {
        let member = PermissionContext::member("u1", vec![]);
        assert!(!permission_passes(&member, &md("MANAGERS", None, None)));

        let manager = PermissionContext {
            user_role: UserRole::Manager,
            ..PermissionContext::member("u1", vec![])
        };
        assert!(permission_passes(&manager, &md("MANAGERS", None, None)));
    }

    #[test]
    fn restricted_requires_user_id_membership() {
        let ctx = PermissionContext::member("u1", vec![]);
        assert!(permission_passes(
            &ctx,
            &md("RESTRICTED", None, Some(vec!["u1", "u2"]))
        ));
        assert!(!permission_passes(
            &ctx,
            &md("RESTRICTED", None, Some(vec!["u2"]))
        ));
    }

    #[test]
    fn unknown_or_missing_access_level_denies() {
        let ctx = PermissionContext::member("u1", vec![]);
        let empty: Metadata = BTreeMap::new();
        assert!(!permission_passes(&ctx, &empty));
        assert!(!permission_passes(&ctx, &md("SOMETHING_ELSE", None, None)));
    }

    #[test]
    fn generic_missing_key_denies() {
        let filter = Filter {
            permissions: None,
            generic: vec![(
                "topic".to_string(),
                GenericPredicate::Equals(Value::string("rust")),
            )],
        };
        let empty: Metadata = BTreeMap::new();
        assert!(!filter.generic_passes(&empty));
    }

    #[test]
    fn generic_operator_map_evaluates_all_operators() {
        let filter = Filter {
            permissions: None,
            generic: vec![(
                "page".to_string(),
                GenericPredicate::Ops(vec![FilterOp::Gte(2.0), FilterOp::Lte(10.0)]),
            )],
        };
        let mut m: Metadata = BTreeMap::new();
        m.insert("page".to_string(), Value::Number(5.0));
        assert!(filter.generic_passes(&m));

        m.insert("page".to_string(), Value::Number(1.0));
        assert!(!filter.generic_passes(&m));
    }

    #[test]
    fn filter_none_matches_everything() {
        let filter = Filter::none();
        assert!(filter.is_empty());
        let metadata = md("RESTRICTED", None, None);
        assert!(filter.matches(&metadata));
    }
}
