//! Contract with the external sync/storage collaborator.
//!
//! The collaborator owns storage, transport and change detection. This crate
//! only routes identities to partitions, caches what the collaborator reports
//! and gates mutations on cached access levels.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::access::{AccessLevel, PermissionGrant};
use crate::identity::{GrantSubject, Identity};
use crate::partition::PartitionRef;
use crate::people::{Person, PersonPatch};
use crate::task::{Task, TaskPatch};

/// Errors reported by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Backend unreachable or not responding
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The acting identity lacks permission
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Partition or record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Request was understood but refused
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Handle to an opened partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHandle {
    id: u64,
    partition: PartitionRef,
    opened_by: Identity,
}

impl PartitionHandle {
    pub fn new(id: u64, partition: PartitionRef, opened_by: Identity) -> Self {
        Self {
            id,
            partition,
            opened_by,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn partition(&self) -> &PartitionRef {
        &self.partition
    }

    pub fn opened_by(&self) -> &Identity {
        &self.opened_by
    }
}

/// Identifies one live subscription so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Positions touched by one change to an ordered collection.
///
/// `removed` indexes the collection before the change; `inserted` and
/// `updated` index the collection after it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub inserted: Vec<usize>,
    pub removed: Vec<usize>,
    pub updated: Vec<usize>,
}

impl ChangeSet {
    pub fn inserted(index: usize) -> Self {
        Self {
            inserted: vec![index],
            ..Self::default()
        }
    }

    pub fn removed(index: usize) -> Self {
        Self {
            removed: vec![index],
            ..Self::default()
        }
    }

    pub fn updated(index: usize) -> Self {
        Self {
            updated: vec![index],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Notification delivered on a subscription.
#[derive(Debug, Clone)]
pub enum CollectionEvent<T> {
    /// The collection changed; `items` is the complete new collection.
    Changed { items: Vec<T>, changes: ChangeSet },
    /// The collaborator could not deliver notifications.
    Error(String),
}

/// A live subscription: its token, the collection at subscribe time, and
/// the ordered feed of later changes.
#[derive(Debug)]
pub struct Subscription<T> {
    pub token: SubscriptionToken,
    pub initial: Vec<T>,
    pub events: mpsc::UnboundedReceiver<CollectionEvent<T>>,
}

/// The external sync/storage service.
///
/// Methods returning futures are the suspension points of the router; every
/// other method must return without blocking.
#[async_trait]
pub trait SyncCollaborator: Send + Sync {
    /// Open (and create, for its owner) a task partition.
    async fn open_partition(
        &self,
        actor: &Identity,
        partition: &PartitionRef,
    ) -> Result<PartitionHandle, CollaboratorError>;

    /// Subscribe to the task collection of an opened partition.
    fn subscribe_tasks(&self, handle: &PartitionHandle) -> Subscription<Task>;

    /// Open the shared people directory and subscribe to it.
    async fn open_directory(&self, actor: &Identity)
        -> Result<Subscription<Person>, CollaboratorError>;

    /// Cancel a subscription. Unknown tokens are ignored.
    fn unsubscribe(&self, token: SubscriptionToken);

    /// Grants visible to `subject`.
    async fn fetch_grants(&self, subject: &Identity)
        -> Result<Vec<PermissionGrant>, CollaboratorError>;

    /// Request a grant change. `AccessLevel::None` revokes.
    async fn apply_grant(
        &self,
        actor: &Identity,
        path: &str,
        subject: &GrantSubject,
        level: AccessLevel,
    ) -> Result<(), CollaboratorError>;

    /// Insert `person` unless a record with the same id exists; returns the
    /// stored record either way.
    async fn upsert_person(&self, person: Person) -> Result<Person, CollaboratorError>;

    /// Change the actor's own person record.
    async fn update_person(
        &self,
        actor: &Identity,
        patch: PersonPatch,
    ) -> Result<Person, CollaboratorError>;

    /// Insert a task by primary key into the handle's partition.
    async fn upsert_task(
        &self,
        actor: &Identity,
        handle: &PartitionHandle,
        task: Task,
    ) -> Result<Task, CollaboratorError>;

    async fn update_task(
        &self,
        actor: &Identity,
        handle: &PartitionHandle,
        id: Uuid,
        patch: TaskPatch,
    ) -> Result<Task, CollaboratorError>;

    async fn delete_task(
        &self,
        actor: &Identity,
        handle: &PartitionHandle,
        id: Uuid,
    ) -> Result<(), CollaboratorError>;
}
