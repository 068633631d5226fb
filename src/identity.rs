//! Identity values and resolution.
//!
//! Identity resolution order for the CLI host:
//! 1) CLI --identity (explicit)
//! 2) SHARED_TASKS_IDENTITY environment variable
//! 3) Persisted value in `<store>/identity`
//! 4) Config default (identity.default)

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};

const IDENTITY_FILENAME: &str = "identity";

/// Wire form of the wildcard grant subject.
pub const WILDCARD: &str = "*";

/// Token used in partition templates to address the caller's own partition.
pub const SELF_TOKEN: &str = "~";

/// An opaque, validated user identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidIdentity("identity cannot be empty".to_string()));
        }
        if trimmed == WILDCARD || trimmed == SELF_TOKEN {
            return Err(Error::InvalidIdentity(format!(
                "'{trimmed}' is reserved and cannot be used as an identity"
            )));
        }
        if trimmed
            .chars()
            .any(|ch| ch.is_whitespace() || ch == '/' || ch.is_control())
        {
            return Err(Error::InvalidIdentity(format!(
                "'{trimmed}' must not contain whitespace or '/'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Identity::new(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Identity::new(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Who a permission grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GrantSubject {
    Identity(Identity),
    Wildcard,
}

impl GrantSubject {
    /// Whether a grant with this subject applies to `identity`.
    pub fn matches(&self, identity: &Identity) -> bool {
        match self {
            GrantSubject::Wildcard => true,
            GrantSubject::Identity(subject) => subject == identity,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, GrantSubject::Wildcard)
    }
}

impl fmt::Display for GrantSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantSubject::Identity(identity) => f.write_str(identity.as_str()),
            GrantSubject::Wildcard => f.write_str(WILDCARD),
        }
    }
}

impl FromStr for GrantSubject {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim() == WILDCARD {
            return Ok(GrantSubject::Wildcard);
        }
        Identity::new(s).map(GrantSubject::Identity)
    }
}

impl TryFrom<String> for GrantSubject {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<GrantSubject> for String {
    fn from(value: GrantSubject) -> Self {
        value.to_string()
    }
}

impl From<Identity> for GrantSubject {
    fn from(value: Identity) -> Self {
        GrantSubject::Identity(value)
    }
}

/// Resolve the acting identity from CLI, environment, persisted value, and config.
pub fn resolve_identity(
    store_root: Option<&Path>,
    cli_identity: Option<&str>,
    config: &Config,
) -> Result<Identity> {
    if let Some(identity) = non_empty(cli_identity) {
        return Identity::new(identity);
    }

    if let Ok(env_identity) = std::env::var("SHARED_TASKS_IDENTITY") {
        if let Some(identity) = non_empty(Some(env_identity.as_str())) {
            return Identity::new(identity);
        }
    }

    if let Some(root) = store_root {
        if let Some(identity) = load_persisted_identity(root)? {
            return Ok(identity);
        }
    }

    match non_empty(config.identity.default.as_deref()) {
        Some(identity) => Identity::new(identity),
        None => Err(Error::InvalidIdentity(
            "no identity set; pass --identity or run `shared-tasks login <identity>`".to_string(),
        )),
    }
}

/// Persist the identity in `<store>/identity`.
pub fn persist_identity(store_root: &Path, identity: &Identity) -> Result<()> {
    std::fs::create_dir_all(store_root)?;
    std::fs::write(identity_path(store_root), format!("{identity}\n"))?;
    Ok(())
}

/// Forget the persisted identity. Returns the one that was stored, if any.
pub fn remove_persisted_identity(store_root: &Path) -> Result<Option<Identity>> {
    let previous = load_persisted_identity(store_root)?;
    match std::fs::remove_file(identity_path(store_root)) {
        Ok(()) => Ok(previous),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::Io(err)),
    }
}

/// Load the identity from `<store>/identity`, if present.
pub fn load_persisted_identity(store_root: &Path) -> Result<Option<Identity>> {
    let path = identity_path(store_root);
    if !path.exists() {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(path)?;
    match non_empty(Some(raw.as_str())) {
        Some(identity) => Identity::new(identity).map(Some),
        None => Ok(None),
    }
}

fn identity_path(store_root: &Path) -> PathBuf {
    store_root.join(IDENTITY_FILENAME)
}

fn non_empty(input: Option<&str>) -> Option<&str> {
    input.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}
