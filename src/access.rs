//! Access levels and permission grants.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{GrantSubject, Identity};

/// Level of access an identity holds over a partition. Higher levels
/// include every lower one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// No access. Also the answer whenever nothing is known.
    #[default]
    None,
    /// May open and read the partition
    Read,
    /// May create, edit and delete records
    Write,
    /// May also change who has access
    Admin,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Admin => "admin",
        }
    }

    pub fn may_read(&self) -> bool {
        *self >= AccessLevel::Read
    }

    /// Write and admin both allow mutating records.
    pub fn may_write(&self) -> bool {
        matches!(self, AccessLevel::Write | AccessLevel::Admin)
    }

    pub fn may_manage(&self) -> bool {
        matches!(self, AccessLevel::Admin)
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(AccessLevel::None),
            "read" => Ok(AccessLevel::Read),
            "write" => Ok(AccessLevel::Write),
            "admin" => Ok(AccessLevel::Admin),
            other => Err(Error::InvalidArgument(format!(
                "invalid access level '{other}' (expected none|read|write|admin)"
            ))),
        }
    }
}

/// A single permission rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub subject: GrantSubject,
    pub path: String,
    pub level: AccessLevel,
}

impl PermissionGrant {
    pub fn new(subject: impl Into<GrantSubject>, path: impl Into<String>, level: AccessLevel) -> Self {
        Self {
            subject: subject.into(),
            path: path.into(),
            level,
        }
    }

    pub fn applies_to(&self, subject: &Identity, path: &str) -> bool {
        self.path == path && self.subject.matches(subject)
    }
}

/// Immutable set of grants as last fetched from the collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct GrantSnapshot {
    grants: Vec<PermissionGrant>,
    fetched_at: DateTime<Utc>,
}

impl GrantSnapshot {
    pub fn new(grants: Vec<PermissionGrant>) -> Self {
        Self {
            grants,
            fetched_at: Utc::now(),
        }
    }

    pub fn grants(&self) -> &[PermissionGrant] {
        &self.grants
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Highest level among the grants on `path` that apply to `subject`,
    /// counting wildcard grants. `None` when nothing matches.
    pub fn access_level(&self, subject: &Identity, path: &str) -> AccessLevel {
        self.grants
            .iter()
            .filter(|grant| grant.applies_to(subject, path))
            .map(|grant| grant.level)
            .max()
            .unwrap_or_default()
    }

    /// Grants on a single path, explicit subjects before the wildcard.
    pub fn grants_for_path(&self, path: &str) -> Vec<&PermissionGrant> {
        let mut grants: Vec<&PermissionGrant> =
            self.grants.iter().filter(|grant| grant.path == path).collect();
        grants.sort_by_key(|grant| (grant.subject.is_wildcard(), grant.subject.to_string()));
        grants
    }
}
