//! Access-scoped task router.
//!
//! The single entry point a host (UI or CLI) talks to. It owns the partition
//! resolver, the permission cache, the task tracker and the people directory
//! for one signed-in identity.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::access::{AccessLevel, GrantSnapshot};
use crate::collaborator::{ChangeSet, SyncCollaborator};
use crate::config::{Config, ServerConfig};
use crate::error::Result;
use crate::identity::{GrantSubject, Identity};
use crate::partition::{PartitionRef, PartitionResolver};
use crate::people::{Person, ProfileDirectory};
use crate::permissions::{PermissionCache, PermissionsUpdated};
use crate::task::{Task, TaskDraft, TaskPatch};
use crate::tracker::{BindOutcome, TaskTracker, TrackerStatus};

/// Summary of pending notifications delivered by `Router::dispatch_pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatched {
    pub tasks: usize,
    pub people: usize,
}

pub struct Router {
    identity: Identity,
    server: ServerConfig,
    is_admin: bool,
    bootstrap_directory: bool,
    online_window: Duration,
    resolver: PartitionResolver,
    permissions: Arc<PermissionCache>,
    tracker: TaskTracker,
    directory: ProfileDirectory,
}

impl Router {
    pub fn new(
        identity: Identity,
        config: &Config,
        collaborator: Arc<dyn SyncCollaborator>,
    ) -> Result<Self> {
        config.validate()?;
        let permissions = Arc::new(PermissionCache::new(
            identity.clone(),
            Arc::clone(&collaborator),
        ));
        let tracker = TaskTracker::new(Arc::clone(&collaborator), Arc::clone(&permissions));
        let directory = ProfileDirectory::new(
            identity.clone(),
            collaborator,
            config.presence.heartbeat()?,
        );
        Ok(Self {
            is_admin: config.is_admin(identity.as_str()),
            identity,
            server: config.server.clone(),
            bootstrap_directory: config.permissions.bootstrap_directory,
            online_window: config.presence.window()?,
            resolver: PartitionResolver::new(&config.partitions),
            permissions,
            tracker,
            directory,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn resolver(&self) -> &PartitionResolver {
        &self.resolver
    }

    /// Sign-in sequence: own profile, directory, own tasks, permissions.
    ///
    /// Administrators also open the directory to everyone when
    /// `permissions.bootstrap_directory` is set.
    pub async fn start(&self) -> Result<Person> {
        if self.is_admin && self.bootstrap_directory {
            self.permissions
                .apply_grant(
                    self.resolver.directory_path(),
                    &GrantSubject::Wildcard,
                    AccessLevel::Write,
                )
                .await?;
        }
        let profile = self.directory.ensure_own_profile().await?;
        self.directory.open().await?;
        // The first open of one's own partition creates its owner grant.
        self.select(&self.identity)?.await?;
        self.permissions.refresh().await?;
        tracing::info!(identity = %self.identity, "router started");
        Ok(profile)
    }

    /// Switch the active task partition to `owner`'s.
    ///
    /// The previous partition stops delivering notifications before this
    /// returns; the returned future completes the open.
    pub fn select(
        &self,
        owner: &Identity,
    ) -> Result<impl Future<Output = Result<BindOutcome>> + Send + 'static> {
        let partition = self.resolver.resolve_for(owner, &self.identity)?;
        Ok(self.tracker.bind_to(partition, self.identity.clone()))
    }

    pub fn selected(&self) -> Option<PartitionRef> {
        self.tracker.partition()
    }

    pub fn status(&self) -> TrackerStatus {
        self.tracker.status()
    }

    /// Sync URL of the selected partition.
    pub fn selected_url(&self) -> Option<String> {
        self.selected().map(|partition| partition.sync_url(&self.server))
    }

    pub fn tasks(&self) -> Arc<Vec<Task>> {
        self.tracker.current_tasks()
    }

    pub fn task(&self, id: Uuid) -> Option<Task> {
        self.tracker.task(id)
    }

    pub fn on_tasks_changed<F>(&self, handler: F)
    where
        F: Fn(&ChangeSet) + Send + Sync + 'static,
    {
        self.tracker.on_change(handler);
    }

    /// Cached access level of `subject` on `owner`'s partition.
    pub fn access_level(&self, subject: &Identity, owner: &Identity) -> Result<AccessLevel> {
        let partition = self.resolver.resolve_for(owner, &self.identity)?;
        Ok(self.permissions.access_level(subject, &partition))
    }

    /// Cached access level of the signed-in identity on the selected partition.
    pub fn my_access(&self) -> AccessLevel {
        self.tracker.access_level(&self.identity)
    }

    pub fn permissions(&self) -> Option<Arc<GrantSnapshot>> {
        self.permissions.snapshot()
    }

    pub fn permission_updates(&self) -> broadcast::Receiver<PermissionsUpdated> {
        self.permissions.subscribe()
    }

    pub fn people(&self) -> Arc<Vec<Person>> {
        self.directory.all_people()
    }

    pub fn person_for(&self, identity: &Identity) -> Option<Person> {
        self.directory.person_for(identity)
    }

    pub fn profile(&self) -> &ProfileDirectory {
        &self.directory
    }

    pub fn on_people_changed<F>(&self, handler: F)
    where
        F: Fn(&ChangeSet) + Send + Sync + 'static,
    {
        self.directory.on_change(handler);
    }

    /// People seen within the configured presence window.
    pub fn online_people(&self, now: DateTime<Utc>) -> Vec<Person> {
        self.directory
            .all_people()
            .iter()
            .filter(|person| person.is_online(now, self.online_window))
            .cloned()
            .collect()
    }

    pub async fn create_task(&self, initial: TaskDraft) -> Result<Task> {
        self.tracker.create_task(&self.identity, initial).await
    }

    pub async fn mutate_task(&self, id: Uuid, patch: TaskPatch) -> Result<Task> {
        self.tracker.update_task(&self.identity, id, patch).await
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<()> {
        self.tracker.delete_task(&self.identity, id).await
    }

    pub async fn refresh_permissions(&self) -> Result<()> {
        self.permissions.refresh().await
    }

    /// Ask for `subject` to get `level` on `owner`'s partition. Call
    /// `refresh_permissions` afterwards to see the change.
    pub async fn grant_access(
        &self,
        owner: &Identity,
        subject: &GrantSubject,
        level: AccessLevel,
    ) -> Result<()> {
        let partition = self.resolver.resolve_for(owner, &self.identity)?;
        self.permissions
            .apply_grant(partition.path(), subject, level)
            .await
    }

    /// Deliver queued task and people notifications.
    pub fn dispatch_pending(&self) -> Result<Dispatched> {
        Ok(Dispatched {
            tasks: self.tracker.dispatch_pending()?,
            people: self.directory.dispatch_pending()?,
        })
    }

    /// Header for the selected task list: owner's name and the viewer's level.
    pub fn partition_title(&self) -> Option<String> {
        let partition = self.selected()?;
        let owner = partition.owner();
        let name = self
            .directory
            .person_for(owner)
            .map(|person| person.display_name())
            .unwrap_or_else(|| owner.to_string());
        let level = self.permissions.access_level(&self.identity, &partition);
        if owner == &self.identity {
            Some(format!("My Tasks ({level})"))
        } else {
            Some(format!("{name}'s Tasks ({level})"))
        }
    }

    /// Tear down subscriptions. Idempotent.
    pub fn shutdown(&self) {
        self.tracker.unbind();
        self.directory.close();
    }
}
