//! Caller identity and ACL evaluation.
//!
//! Group membership is resolved once at login through the identity
//! collaborator; every subsequent ACL check is a pure computation over the
//! resolved identity.
use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::params::{Access, Acl};

/// ACL entry matching every authenticated user.
pub const EVERYONE: &str = "everyone";

/// Resolves group membership for authenticated users.
#[async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    /// Groups the user belongs to, excluding the user name itself.
    async fn groups(&self, user: &str) -> Result<Vec<String>>;
}

/// Identity resolver that knows no groups.
pub struct NoGroups;

#[async_trait]
impl IdentityResolver for NoGroups {
    async fn groups(&self, _user: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// An authenticated caller with resolved group membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    user: String,
    groups: Vec<String>,
}

impl Identity {
    pub fn new(user: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            user: user.into(),
            groups,
        }
    }

    pub async fn resolve(user: impl Into<String>, resolver: &dyn IdentityResolver) -> Result<Self> {
        let user = user.into();
        let groups = resolver.groups(&user).await?;
        Ok(Self { user, groups })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Whether this identity matches `name` directly or via a group.
    pub fn is(&self, name: &str) -> bool {
        name == EVERYONE || self.user == name || self.groups.iter().any(|g| g == name)
    }

    /// Whether any entry in `entries` matches this identity.
    pub fn in_any(&self, entries: &[String]) -> bool {
        entries.iter().any(|entry| self.is(entry))
    }
}

/// Computes the caller's effective access to an entity.
///
/// Tiers are checked highest first, so a user present in several tiers
/// gets the strongest one. Ownership implies admin.
pub fn effective_access(identity: &Identity, owner: &str, acl: &Acl) -> Option<Access> {
    if identity.is(owner) || identity.in_any(&acl.admin) {
        Some(Access::Admin)
    } else if identity.in_any(&acl.write) {
        Some(Access::Write)
    } else if identity.in_any(&acl.read) {
        Some(Access::Read)
    } else {
        None
    }
}

/// Requires at least `level` access, answering `Unauthorized` otherwise.
pub fn check_access(
    identity: &Identity,
    owner: &str,
    acl: &Acl,
    level: Access,
) -> Result<Access> {
    match effective_access(identity, owner, acl) {
        Some(access) if access >= level => Ok(access),
        _ => Err(Error::Unauthorized("unauthorized".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    fn acl(read: &[&str], write: &[&str], admin: &[&str]) -> Acl {
        Acl {
            read: read.iter().map(|s| s.to_string()).collect(),
            write: write.iter().map(|s| s.to_string()).collect(),
            admin: admin.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn owner_has_admin() {
        let bob = Identity::new("bob", vec![]);
        assert_eq!(
            effective_access(&bob, "bob", &Acl::default()),
            Some(Access::Admin)
        );
    }

    #[test]
    fn group_membership_grants_access() {
        let bob = Identity::new("bob", vec!["bob-group".to_string()]);
        let acl = acl(&["bob-group"], &[], &[]);
        assert_eq!(effective_access(&bob, "alice", &acl), Some(Access::Read));
    }

    #[test]
    fn everyone_matches_any_identity() {
        let carol = Identity::new("carol", vec![]);
        let acl = acl(&["everyone"], &[], &[]);
        assert_eq!(effective_access(&carol, "alice", &acl), Some(Access::Read));
    }

    #[test]
    fn highest_tier_wins() {
        let bob = Identity::new("bob", vec![]);
        // Present in both read and admin: admin wins.
        let acl = acl(&["bob"], &[], &["bob"]);
        assert_eq!(effective_access(&bob, "alice", &acl), Some(Access::Admin));
    }

    #[test]
    fn check_access_enforces_tier_ordering() {
        let bob = Identity::new("bob", vec![]);
        let acl = acl(&[], &["bob"], &[]);
        check_access(&bob, "alice", &acl, Access::Read).expect("read via write");
        check_access(&bob, "alice", &acl, Access::Write).expect("write");
        let err = check_access(&bob, "alice", &acl, Access::Admin).expect_err("admin");
        assert_eq!(err.kind(), Kind::Unauthorized);
    }

    #[test]
    fn no_match_is_unauthorized() {
        let mallory = Identity::new("mallory", vec![]);
        let err =
            check_access(&mallory, "alice", &Acl::default(), Access::Read).expect_err("denied");
        assert_eq!(err.kind(), Kind::Unauthorized);
    }

    #[tokio::test]
    async fn resolve_queries_the_resolver() {
        struct StaticGroups;

        #[async_trait]
        impl IdentityResolver for StaticGroups {
            async fn groups(&self, user: &str) -> Result<Vec<String>> {
                Ok(vec![format!("{user}-group")])
            }
        }

        let identity = Identity::resolve("bob", &StaticGroups).await.expect("resolve");
        assert!(identity.is("bob-group"));
        assert!(!identity.is("alice-group"));
    }
}
