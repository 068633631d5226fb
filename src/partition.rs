//! Partition addressing.
//!
//! Every identity owns one private task partition whose path is derived from
//! a template such as `/~/MyTasks`. The owner addresses it through the self
//! token (`/~/MyTasks`), everyone else through the explicit identity
//! (`/alice/MyTasks`). Both forms name the same physical partition.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::config::{PartitionsConfig, ServerConfig};
use crate::error::Result;
use crate::identity::Identity;

/// A resolved reference to one user's task partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRef {
    owner: Identity,
    path: String,
    addressed_as: String,
}

impl PartitionRef {
    /// Identity that owns the partition.
    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    /// Physical path, identical for every viewer.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Literal path used to address the partition (may contain the self token).
    pub fn addressed_as(&self) -> &str {
        &self.addressed_as
    }

    /// Whether the reference was built through the self token.
    pub fn is_self_addressed(&self) -> bool {
        self.path != self.addressed_as
    }

    /// Full sync URL for this partition, e.g. `realm://127.0.0.1:9080/~/MyTasks`.
    pub fn sync_url(&self, server: &ServerConfig) -> String {
        format!(
            "{}://{}:{}{}",
            server.scheme, server.host, server.port, self.addressed_as
        )
    }
}

impl PartialEq for PartitionRef {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.path == other.path
    }
}

impl Eq for PartitionRef {}

impl Hash for PartitionRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        self.path.hash(state);
    }
}

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Maps identities to their task partitions. Pure; performs no I/O.
#[derive(Debug, Clone)]
pub struct PartitionResolver {
    template: String,
    self_token: String,
    directory: String,
}

impl PartitionResolver {
    pub fn new(config: &PartitionsConfig) -> Self {
        Self {
            template: config.tasks_template.clone(),
            self_token: config.self_token.trim().to_string(),
            directory: config.directory.clone(),
        }
    }

    /// Resolve the partition owned by `owner`.
    ///
    /// `viewer_is_owner` only selects the literal form of the address; the
    /// physical path is the same either way.
    pub fn resolve(&self, owner: &str, viewer_is_owner: bool) -> Result<PartitionRef> {
        let owner = Identity::new(owner)?;
        let path = self.physical_path(&owner);
        let addressed_as = if viewer_is_owner {
            self.template.clone()
        } else {
            path.clone()
        };
        Ok(PartitionRef {
            owner,
            path,
            addressed_as,
        })
    }

    /// Resolve `owner`'s partition as seen by `viewer`.
    pub fn resolve_for(&self, owner: &Identity, viewer: &Identity) -> Result<PartitionRef> {
        self.resolve(owner.as_str(), owner == viewer)
    }

    /// Physical path of `owner`'s partition.
    pub fn physical_path(&self, owner: &Identity) -> String {
        self.template
            .split('/')
            .map(|segment| {
                if segment == self.self_token {
                    owner.as_str()
                } else {
                    segment
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Path of the shared people directory.
    pub fn directory_path(&self) -> &str {
        &self.directory
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

impl Default for PartitionResolver {
    fn default() -> Self {
        Self::new(&PartitionsConfig::default())
    }
}
