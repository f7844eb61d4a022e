//! Entity identifiers, access levels and tag conventions.
//!
//! # Purpose
//! Defines the path forms used throughout the store (`user/name`,
//! `cloud/user/name`), the ACL model, and the wire tag rendering/parsing
//! rules for users, models, clouds and cloud credentials.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default domain attached to bare usernames in wire tags.
pub const EXTERNAL_DOMAIN: &str = "external";

/// Universal `user/name` identifier for controllers and models.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityPath {
    pub user: String,
    pub name: String,
}

impl EntityPath {
    pub fn new(user: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.name)
    }
}

impl FromStr for EntityPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((user, name)) if !user.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(user, name))
            }
            _ => Err(Error::BadRequest(format!("invalid entity path {s:?}"))),
        }
    }
}

/// `cloud/user/name` identifier for credentials.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CredentialPath {
    pub cloud: String,
    pub user: String,
    pub name: String,
}

impl CredentialPath {
    pub fn new(
        cloud: impl Into<String>,
        user: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cloud: cloud.into(),
            user: user.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CredentialPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cloud, self.user, self.name)
    }
}

impl FromStr for CredentialPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(cloud), Some(user), Some(name), None)
                if !cloud.is_empty() && !user.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(cloud, user, name))
            }
            _ => Err(Error::BadRequest(format!("invalid credential path {s:?}"))),
        }
    }
}

/// Access-control list with read/write/admin tiers. Entries may be user
/// names or group names; group membership is resolved by the identity
/// collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    #[serde(default)]
    pub admin: Vec<String>,
}

/// ACL tiers in increasing order; a higher tier implies the lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
    Admin,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
            Access::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for Access {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Access::Read),
            "write" => Ok(Access::Write),
            "admin" => Ok(Access::Admin),
            _ => Err(Error::BadRequest(format!("{s:?} model access not valid"))),
        }
    }
}

/// Model lifecycle value driven by the downstream delta stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Life::Alive => write!(f, "alive"),
            Life::Dying => write!(f, "dying"),
            Life::Dead => write!(f, "dead"),
        }
    }
}

/// Renders a user tag, attaching the external domain to bare names.
pub fn user_tag(user: &str) -> String {
    if user.contains('@') {
        format!("user-{user}")
    } else {
        format!("user-{user}@{EXTERNAL_DOMAIN}")
    }
}

/// Parses a user tag, normalising `@external` away and rejecting local
/// users, which have no meaning outside a single controller.
pub fn parse_user_tag(tag: &str) -> Result<String> {
    let user = tag
        .strip_prefix("user-")
        .ok_or_else(|| Error::BadRequest(format!("invalid user tag {tag:?}")))?;
    if user.is_empty() {
        return Err(Error::BadRequest(format!("invalid user tag {tag:?}")));
    }
    match user.split_once('@') {
        Some((_, "local")) | None => Err(Error::BadRequest(format!(
            "unsupported local user {user:?}"
        ))),
        Some((name, EXTERNAL_DOMAIN)) => Ok(name.to_string()),
        Some(_) => Ok(user.to_string()),
    }
}

pub fn model_tag(uuid: &str) -> String {
    format!("model-{uuid}")
}

pub fn parse_model_tag(tag: &str) -> Result<String> {
    tag.strip_prefix("model-")
        .filter(|uuid| !uuid.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::BadRequest(format!("invalid model tag {tag:?}")))
}

pub fn cloud_tag(name: &str) -> String {
    format!("cloud-{name}")
}

pub fn parse_cloud_tag(tag: &str) -> Result<String> {
    tag.strip_prefix("cloud-")
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::BadRequest(format!("invalid cloud tag {tag:?}")))
}

/// Renders a cloud credential tag. The segments inside the tag are
/// underscore separated and the user carries its domain.
pub fn cloud_credential_tag(path: &CredentialPath) -> String {
    let user = if path.user.contains('@') {
        path.user.clone()
    } else {
        format!("{}@{EXTERNAL_DOMAIN}", path.user)
    };
    format!("cloudcred-{}_{}_{}", path.cloud, user, path.name)
}

pub fn parse_cloud_credential_tag(tag: &str) -> Result<CredentialPath> {
    let rest = tag
        .strip_prefix("cloudcred-")
        .ok_or_else(|| Error::BadRequest(format!("invalid cloud credential tag {tag:?}")))?;
    let mut parts = rest.split('_');
    let (cloud, user, name) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(cloud), Some(user), Some(name), None)
            if !cloud.is_empty() && !user.is_empty() && !name.is_empty() =>
        {
            (cloud, user, name)
        }
        _ => {
            return Err(Error::BadRequest(format!(
                "invalid cloud credential tag {tag:?}"
            )))
        }
    };
    let user = parse_user_tag(&format!("user-{user}"))?;
    Ok(CredentialPath::new(cloud, user, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn entity_path_round_trip() {
        let path: EntityPath = "bob/model".parse().expect("path");
        assert_eq!(path, EntityPath::new("bob", "model"));
        assert_eq!(path.to_string(), "bob/model");
    }

    #[test]
    fn entity_path_rejects_malformed() {
        for bad in ["bob", "/model", "bob/", "a/b/c"] {
            let err = bad.parse::<EntityPath>().expect_err("path");
            assert_eq!(err.kind(), Kind::BadRequest);
        }
    }

    #[test]
    fn credential_path_round_trip() {
        let path: CredentialPath = "dummy/bob/cred1".parse().expect("path");
        assert_eq!(path, CredentialPath::new("dummy", "bob", "cred1"));
        assert_eq!(path.to_string(), "dummy/bob/cred1");
    }

    #[test]
    fn user_tags_attach_external_domain() {
        assert_eq!(user_tag("alice"), "user-alice@external");
        assert_eq!(user_tag("alice@domain"), "user-alice@domain");
    }

    #[test]
    fn parse_user_tag_normalises_external() {
        assert_eq!(parse_user_tag("user-alice@external").expect("tag"), "alice");
        assert_eq!(
            parse_user_tag("user-alice@domain").expect("tag"),
            "alice@domain"
        );
    }

    #[test]
    fn parse_user_tag_rejects_local() {
        let err = parse_user_tag("user-admin@local").expect_err("tag");
        assert_eq!(err.kind(), Kind::BadRequest);
        let err = parse_user_tag("user-admin").expect_err("tag");
        assert_eq!(err.kind(), Kind::BadRequest);
    }

    #[test]
    fn cloud_credential_tags_use_underscores() {
        let path = CredentialPath::new("dummy", "alice", "cred");
        assert_eq!(
            cloud_credential_tag(&path),
            "cloudcred-dummy_alice@external_cred"
        );
        let path = CredentialPath::new("dummy", "alice@domain", "cred");
        assert_eq!(
            cloud_credential_tag(&path),
            "cloudcred-dummy_alice@domain_cred"
        );
    }

    #[test]
    fn cloud_credential_tag_round_trip() {
        let path = CredentialPath::new("aws", "bob", "main");
        let parsed = parse_cloud_credential_tag(&cloud_credential_tag(&path)).expect("tag");
        assert_eq!(parsed, path);
    }

    #[test]
    fn access_ordering_implies_lower_tiers() {
        assert!(Access::Admin > Access::Write);
        assert!(Access::Write > Access::Read);
        let err = "superpowers".parse::<Access>().expect_err("access");
        assert_eq!(
            err.to_string(),
            "\"superpowers\" model access not valid"
        );
    }

    #[test]
    fn model_and_cloud_tags() {
        assert_eq!(model_tag("u-1"), "model-u-1");
        assert_eq!(parse_model_tag("model-u-1").expect("tag"), "u-1");
        assert_eq!(cloud_tag("aws"), "cloud-aws");
        assert_eq!(parse_cloud_tag("cloud-aws").expect("tag"), "aws");
        assert!(parse_model_tag("application-x").is_err());
    }
}
