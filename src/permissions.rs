//! Cached permission snapshot.
//!
//! The cache is refreshed on demand and never updated optimistically. Queries
//! are answered from the last complete snapshot; before the first successful
//! refresh every query answers `AccessLevel::None`.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::access::{AccessLevel, GrantSnapshot};
use crate::collaborator::SyncCollaborator;
use crate::error::{Error, Result};
use crate::identity::{GrantSubject, Identity};
use crate::partition::PartitionRef;

const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// Emitted once per successful refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionsUpdated {
    pub grants: usize,
    pub fetched_at: DateTime<Utc>,
}

pub struct PermissionCache {
    identity: Identity,
    collaborator: Arc<dyn SyncCollaborator>,
    snapshot: RwLock<Option<Arc<GrantSnapshot>>>,
    updates: broadcast::Sender<PermissionsUpdated>,
}

impl PermissionCache {
    pub fn new(identity: Identity, collaborator: Arc<dyn SyncCollaborator>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            identity,
            collaborator,
            snapshot: RwLock::new(None),
            updates,
        }
    }

    /// Re-fetch all grants visible to this cache's identity.
    ///
    /// On failure the previous snapshot stays in place and nothing is emitted.
    pub async fn refresh(&self) -> Result<()> {
        let grants = match self.collaborator.fetch_grants(&self.identity).await {
            Ok(grants) => grants,
            Err(err) => {
                tracing::warn!(identity = %self.identity, error = %err, "permission refresh failed");
                return Err(Error::PermissionFetchFailed(err.to_string()));
            }
        };

        let snapshot = Arc::new(GrantSnapshot::new(grants));
        let update = PermissionsUpdated {
            grants: snapshot.len(),
            fetched_at: snapshot.fetched_at(),
        };
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        tracing::debug!(identity = %self.identity, grants = update.grants, "permissions refreshed");

        // No receivers is fine.
        let _ = self.updates.send(update);
        Ok(())
    }

    /// The last complete snapshot, if any has loaded.
    pub fn snapshot(&self) -> Option<Arc<GrantSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }

    pub fn access_level(&self, subject: &Identity, partition: &PartitionRef) -> AccessLevel {
        self.access_level_for_path(subject, partition.path())
    }

    pub fn access_level_for_path(&self, subject: &Identity, path: &str) -> AccessLevel {
        self.snapshot()
            .map(|snapshot| snapshot.access_level(subject, path))
            .unwrap_or_default()
    }

    /// Ask the collaborator to change a grant. The cache is left untouched;
    /// call `refresh` to observe the effect.
    pub async fn apply_grant(
        &self,
        path: &str,
        subject: &GrantSubject,
        level: AccessLevel,
    ) -> Result<()> {
        self.collaborator
            .apply_grant(&self.identity, path, subject, level)
            .await
            .map_err(|err| {
                tracing::warn!(
                    identity = %self.identity,
                    %path,
                    %subject,
                    %level,
                    error = %err,
                    "grant request failed"
                );
                Error::GrantApplyFailed {
                    partition: path.to_string(),
                    subject: subject.to_string(),
                    level,
                    reason: err.to_string(),
                }
            })?;
        tracing::info!(identity = %self.identity, %path, %subject, %level, "grant requested");
        Ok(())
    }

    /// Receive an event after every successful refresh.
    pub fn subscribe(&self) -> broadcast::Receiver<PermissionsUpdated> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCollaborator;
    use crate::partition::PartitionResolver;

    fn id(raw: &str) -> Identity {
        Identity::new(raw).expect("identity")
    }

    async fn setup() -> (Arc<InMemoryCollaborator>, PermissionCache, PartitionRef) {
        let memory = Arc::new(InMemoryCollaborator::new());
        let bob_tasks = PartitionResolver::default()
            .resolve("bob", true)
            .expect("partition");
        memory
            .open_partition(&id("bob"), &bob_tasks)
            .await
            .expect("bob opens");
        let cache = PermissionCache::new(id("bob"), memory.clone());
        (memory, cache, bob_tasks)
    }

    #[tokio::test]
    async fn unknown_before_first_refresh() {
        let (_memory, cache, bob_tasks) = setup().await;
        assert!(!cache.is_loaded());
        assert_eq!(cache.access_level(&id("bob"), &bob_tasks), AccessLevel::None);
    }

    #[tokio::test]
    async fn refresh_loads_and_notifies_once() {
        let (_memory, cache, bob_tasks) = setup().await;
        let mut updates = cache.subscribe();

        cache.refresh().await.expect("refresh");

        assert_eq!(cache.access_level(&id("bob"), &bob_tasks), AccessLevel::Admin);
        let update = updates.try_recv().expect("one update");
        assert_eq!(update.grants, 1);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let (memory, cache, bob_tasks) = setup().await;
        cache.refresh().await.expect("refresh");
        let before = cache.snapshot().expect("snapshot");
        let mut updates = cache.subscribe();

        memory.fail_fetches(Some("offline"));
        let err = cache.refresh().await.expect_err("fetch fails");

        assert!(matches!(err, Error::PermissionFetchFailed(_)));
        let after = cache.snapshot().expect("still loaded");
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(cache.access_level(&id("bob"), &bob_tasks), AccessLevel::Admin);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn grants_show_up_only_after_refresh() {
        let (_memory, cache, bob_tasks) = setup().await;
        cache.refresh().await.expect("refresh");

        cache
            .apply_grant(
                bob_tasks.path(),
                &GrantSubject::Identity(id("alice")),
                AccessLevel::Write,
            )
            .await
            .expect("grant");
        assert_eq!(cache.access_level(&id("alice"), &bob_tasks), AccessLevel::None);

        cache.refresh().await.expect("refresh");
        assert_eq!(cache.access_level(&id("alice"), &bob_tasks), AccessLevel::Write);
    }

    #[tokio::test]
    async fn wildcard_and_explicit_grants_take_the_highest() {
        let (_memory, cache, bob_tasks) = setup().await;
        cache
            .apply_grant(bob_tasks.path(), &GrantSubject::Wildcard, AccessLevel::Read)
            .await
            .expect("wildcard");
        cache
            .apply_grant(
                bob_tasks.path(),
                &GrantSubject::Identity(id("alice")),
                AccessLevel::Write,
            )
            .await
            .expect("alice");
        cache.refresh().await.expect("refresh");

        assert_eq!(cache.access_level(&id("alice"), &bob_tasks), AccessLevel::Write);
        assert_eq!(cache.access_level(&id("carol"), &bob_tasks), AccessLevel::Read);
    }

    #[tokio::test]
    async fn rejected_grant_reports_the_request() {
        let (memory, cache, bob_tasks) = setup().await;
        memory.fail_grants(Some("read-only replica"));

        let err = cache
            .apply_grant(bob_tasks.path(), &GrantSubject::Wildcard, AccessLevel::Read)
            .await
            .expect_err("rejected");

        match err {
            Error::GrantApplyFailed {
                partition,
                subject,
                level,
                reason,
            } => {
                assert_eq!(partition, "/bob/MyTasks");
                assert_eq!(subject, "*");
                assert_eq!(level, AccessLevel::Read);
                assert!(reason.contains("read-only replica"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
