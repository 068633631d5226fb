//! In-process collaborator.
//!
//! Keeps partitions, people and grants in memory and delivers change
//! notifications over channels, following the same authorization rules as
//! the sync service: owners administer their own partition, everyone else
//! needs a grant. The whole store can be exported and re-imported, which is
//! how the CLI host persists it between invocations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

use crate::access::{AccessLevel, PermissionGrant};
use crate::collaborator::{
    ChangeSet, CollaboratorError, CollectionEvent, PartitionHandle, Subscription,
    SubscriptionToken, SyncCollaborator,
};
use crate::identity::{GrantSubject, Identity};
use crate::partition::PartitionRef;
use crate::people::{Person, PersonPatch};
use crate::task::{Task, TaskPatch};

/// Serializable contents of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub people: Vec<Person>,
    #[serde(default)]
    pub partitions: BTreeMap<String, StoredPartition>,
    #[serde(default)]
    pub grants: Vec<PermissionGrant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPartition {
    pub owner: Identity,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

type TaskSender = UnboundedSender<CollectionEvent<Task>>;
type PersonSender = UnboundedSender<CollectionEvent<Person>>;

#[derive(Default)]
struct Inner {
    store: StoreState,
    next_id: u64,
    admins: HashSet<Identity>,
    task_subscribers: HashMap<u64, (String, TaskSender)>,
    people_subscribers: HashMap<u64, PersonSender>,
    open_failures: HashMap<String, String>,
    fetch_failure: Option<String>,
    grant_failure: Option<String>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn partition_owner(&self, path: &str) -> Option<&Identity> {
        self.store.partitions.get(path).map(|partition| &partition.owner)
    }

    fn level(&self, actor: &Identity, path: &str) -> AccessLevel {
        if self.admins.contains(actor) || self.partition_owner(path) == Some(actor) {
            return AccessLevel::Admin;
        }
        self.store
            .grants
            .iter()
            .filter(|grant| grant.applies_to(actor, path))
            .map(|grant| grant.level)
            .max()
            .unwrap_or_default()
    }

    fn require(
        &self,
        actor: &Identity,
        path: &str,
        needed: AccessLevel,
    ) -> Result<(), CollaboratorError> {
        let level = self.level(actor, path);
        if level < needed {
            return Err(CollaboratorError::Unauthorized(format!(
                "{actor} has {level} access to {path}, needs {needed}"
            )));
        }
        Ok(())
    }

    fn tasks_mut(&mut self, path: &str) -> Result<&mut Vec<Task>, CollaboratorError> {
        self.store
            .partitions
            .get_mut(path)
            .map(|partition| &mut partition.tasks)
            .ok_or_else(|| CollaboratorError::NotFound(format!("partition {path}")))
    }

    fn publish_tasks(&mut self, path: &str, changes: ChangeSet) {
        let items = self
            .store
            .partitions
            .get(path)
            .map(|partition| partition.tasks.clone())
            .unwrap_or_default();
        self.task_subscribers.retain(|_, (subscribed_path, sender)| {
            if subscribed_path != path {
                return true;
            }
            sender
                .send(CollectionEvent::Changed {
                    items: items.clone(),
                    changes: changes.clone(),
                })
                .is_ok()
        });
    }

    fn publish_people(&mut self, changes: ChangeSet) {
        let items = self.store.people.clone();
        self.people_subscribers.retain(|_, sender| {
            sender
                .send(CollectionEvent::Changed {
                    items: items.clone(),
                    changes: changes.clone(),
                })
                .is_ok()
        });
    }
}

/// A complete `SyncCollaborator` held in memory.
#[derive(Default)]
pub struct InMemoryCollaborator {
    inner: Mutex<Inner>,
}

impl InMemoryCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously exported contents.
    pub fn from_state(store: StoreState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                store,
                ..Inner::default()
            }),
        }
    }

    /// Identities with admin access to every path.
    pub fn with_admins<I>(self, admins: I) -> Self
    where
        I: IntoIterator<Item = Identity>,
    {
        self.lock().admins.extend(admins);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Export the current contents.
    pub fn state(&self) -> StoreState {
        self.lock().store.clone()
    }

    /// Make every open of `path` fail with `reason` until cleared.
    pub fn fail_opens(&self, path: &str, reason: &str) {
        self.lock()
            .open_failures
            .insert(path.to_string(), reason.to_string());
    }

    pub fn clear_open_failure(&self, path: &str) {
        self.lock().open_failures.remove(path);
    }

    /// Make grant fetches fail with `reason`, or succeed again with `None`.
    pub fn fail_fetches(&self, reason: Option<&str>) {
        self.lock().fetch_failure = reason.map(str::to_string);
    }

    /// Make grant changes fail with `reason`, or succeed again with `None`.
    pub fn fail_grants(&self, reason: Option<&str>) {
        self.lock().grant_failure = reason.map(str::to_string);
    }

    /// Deliver a notification error to every subscriber of `path`.
    pub fn push_error(&self, path: &str, reason: &str) {
        let inner = self.lock();
        for (subscribed_path, sender) in inner.task_subscribers.values() {
            if subscribed_path == path {
                let _ = sender.send(CollectionEvent::Error(reason.to_string()));
            }
        }
    }

    /// Live task subscriptions on `path`.
    pub fn subscriber_count(&self, path: &str) -> usize {
        self.lock()
            .task_subscribers
            .values()
            .filter(|(subscribed_path, _)| subscribed_path == path)
            .count()
    }

    pub fn directory_subscriber_count(&self) -> usize {
        self.lock().people_subscribers.len()
    }

    /// Number of person records with `id`.
    pub fn people_with_id(&self, id: &Identity) -> usize {
        self.lock()
            .store
            .people
            .iter()
            .filter(|person| &person.id == id)
            .count()
    }
}

#[async_trait]
impl SyncCollaborator for InMemoryCollaborator {
    async fn open_partition(
        &self,
        actor: &Identity,
        partition: &PartitionRef,
    ) -> Result<PartitionHandle, CollaboratorError> {
        let mut inner = self.lock();
        let path = partition.path();
        if let Some(reason) = inner.open_failures.get(path) {
            return Err(CollaboratorError::Unavailable(reason.clone()));
        }

        if !inner.store.partitions.contains_key(path) {
            if partition.owner() != actor {
                return Err(CollaboratorError::NotFound(format!("partition {path}")));
            }
            inner.store.partitions.insert(
                path.to_string(),
                StoredPartition {
                    owner: actor.clone(),
                    tasks: Vec::new(),
                },
            );
            inner.store.grants.push(PermissionGrant::new(
                actor.clone(),
                path,
                AccessLevel::Admin,
            ));
            tracing::debug!(%actor, %path, "created partition");
        }

        inner.require(actor, path, AccessLevel::Read)?;
        let id = inner.next_id();
        Ok(PartitionHandle::new(id, partition.clone(), actor.clone()))
    }

    fn subscribe_tasks(&self, handle: &PartitionHandle) -> Subscription<Task> {
        let mut inner = self.lock();
        let path = handle.partition().path().to_string();
        let initial = inner
            .store
            .partitions
            .get(&path)
            .map(|partition| partition.tasks.clone())
            .unwrap_or_default();
        let (sender, events) = mpsc::unbounded_channel();
        let id = inner.next_id();
        inner.task_subscribers.insert(id, (path, sender));
        Subscription {
            token: SubscriptionToken(id),
            initial,
            events,
        }
    }

    async fn open_directory(
        &self,
        _actor: &Identity,
    ) -> Result<Subscription<Person>, CollaboratorError> {
        let mut inner = self.lock();
        let initial = inner.store.people.clone();
        let (sender, events) = mpsc::unbounded_channel();
        let id = inner.next_id();
        inner.people_subscribers.insert(id, sender);
        Ok(Subscription {
            token: SubscriptionToken(id),
            initial,
            events,
        })
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        let mut inner = self.lock();
        inner.task_subscribers.remove(&token.0);
        inner.people_subscribers.remove(&token.0);
    }

    async fn fetch_grants(
        &self,
        subject: &Identity,
    ) -> Result<Vec<PermissionGrant>, CollaboratorError> {
        let inner = self.lock();
        if let Some(reason) = &inner.fetch_failure {
            return Err(CollaboratorError::Unavailable(reason.clone()));
        }
        Ok(inner
            .store
            .grants
            .iter()
            .filter(|grant| {
                grant.subject.matches(subject)
                    || inner.level(subject, &grant.path) == AccessLevel::Admin
            })
            .cloned()
            .collect())
    }

    async fn apply_grant(
        &self,
        actor: &Identity,
        path: &str,
        subject: &GrantSubject,
        level: AccessLevel,
    ) -> Result<(), CollaboratorError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.grant_failure {
            return Err(CollaboratorError::Rejected(reason.clone()));
        }
        inner.require(actor, path, AccessLevel::Admin)?;
        if let (Some(owner), GrantSubject::Identity(target)) = (inner.partition_owner(path), subject) {
            if owner == target {
                return Err(CollaboratorError::Rejected(format!(
                    "cannot change the owner's access to {path}"
                )));
            }
        }

        inner
            .store
            .grants
            .retain(|grant| !(grant.path == path && &grant.subject == subject));
        if level != AccessLevel::None {
            inner
                .store
                .grants
                .push(PermissionGrant::new(subject.clone(), path, level));
        }
        Ok(())
    }

    async fn upsert_person(&self, person: Person) -> Result<Person, CollaboratorError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.store.people.iter().find(|p| p.id == person.id) {
            return Ok(existing.clone());
        }
        inner.store.people.push(person.clone());
        let index = inner.store.people.len() - 1;
        inner.publish_people(ChangeSet::inserted(index));
        Ok(person)
    }

    async fn update_person(
        &self,
        actor: &Identity,
        patch: PersonPatch,
    ) -> Result<Person, CollaboratorError> {
        let mut inner = self.lock();
        let index = inner
            .store
            .people
            .iter()
            .position(|person| &person.id == actor)
            .ok_or_else(|| CollaboratorError::NotFound(format!("person {actor}")))?;
        inner.store.people[index].apply(&patch);
        let person = inner.store.people[index].clone();
        inner.publish_people(ChangeSet::updated(index));
        Ok(person)
    }

    async fn upsert_task(
        &self,
        actor: &Identity,
        handle: &PartitionHandle,
        task: Task,
    ) -> Result<Task, CollaboratorError> {
        let mut inner = self.lock();
        let path = handle.partition().path();
        inner.require(actor, path, AccessLevel::Write)?;
        let tasks = inner.tasks_mut(path)?;
        if let Some(existing) = tasks.iter().find(|existing| existing.id == task.id) {
            return Ok(existing.clone());
        }
        tasks.push(task.clone());
        let index = tasks.len() - 1;
        inner.publish_tasks(path, ChangeSet::inserted(index));
        Ok(task)
    }

    async fn update_task(
        &self,
        actor: &Identity,
        handle: &PartitionHandle,
        id: Uuid,
        patch: TaskPatch,
    ) -> Result<Task, CollaboratorError> {
        let mut inner = self.lock();
        let path = handle.partition().path();
        inner.require(actor, path, AccessLevel::Write)?;
        let tasks = inner.tasks_mut(path)?;
        let index = tasks
            .iter()
            .position(|task| task.id == id)
            .ok_or_else(|| CollaboratorError::NotFound(format!("task {id}")))?;
        tasks[index].apply(&patch, actor, Utc::now());
        let task = tasks[index].clone();
        inner.publish_tasks(path, ChangeSet::updated(index));
        Ok(task)
    }

    async fn delete_task(
        &self,
        actor: &Identity,
        handle: &PartitionHandle,
        id: Uuid,
    ) -> Result<(), CollaboratorError> {
        let mut inner = self.lock();
        let path = handle.partition().path();
        inner.require(actor, path, AccessLevel::Write)?;
        let tasks = inner.tasks_mut(path)?;
        let index = tasks
            .iter()
            .position(|task| task.id == id)
            .ok_or_else(|| CollaboratorError::NotFound(format!("task {id}")))?;
        tasks.remove(index);
        inner.publish_tasks(path, ChangeSet::removed(index));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionResolver;
    use crate::task::TaskDraft;

    fn id(raw: &str) -> Identity {
        Identity::new(raw).expect("identity")
    }

    #[tokio::test]
    async fn owner_open_creates_partition_with_admin_grant() {
        let collaborator = InMemoryCollaborator::new();
        let alice = id("alice");
        let partition = PartitionResolver::default()
            .resolve("alice", true)
            .expect("partition");

        collaborator
            .open_partition(&alice, &partition)
            .await
            .expect("open");

        let state = collaborator.state();
        assert!(state.partitions.contains_key("/alice/MyTasks"));
        let grants = collaborator.fetch_grants(&alice).await.expect("grants");
        assert_eq!(
            grants,
            vec![PermissionGrant::new(alice, "/alice/MyTasks", AccessLevel::Admin)]
        );
    }

    #[tokio::test]
    async fn foreign_open_needs_partition_and_grant() {
        let collaborator = InMemoryCollaborator::new();
        let resolver = PartitionResolver::default();
        let bob_tasks = resolver.resolve("bob", false).expect("partition");

        let missing = collaborator
            .open_partition(&id("alice"), &bob_tasks)
            .await
            .expect_err("missing");
        assert!(matches!(missing, CollaboratorError::NotFound(_)));

        collaborator
            .open_partition(&id("bob"), &resolver.resolve("bob", true).expect("own"))
            .await
            .expect("bob opens");
        let denied = collaborator
            .open_partition(&id("alice"), &bob_tasks)
            .await
            .expect_err("denied");
        assert!(matches!(denied, CollaboratorError::Unauthorized(_)));

        collaborator
            .apply_grant(
                &id("bob"),
                bob_tasks.path(),
                &GrantSubject::Identity(id("alice")),
                AccessLevel::Read,
            )
            .await
            .expect("grant");
        collaborator
            .open_partition(&id("alice"), &bob_tasks)
            .await
            .expect("alice opens");
    }

    #[tokio::test]
    async fn task_writes_fan_out_to_subscribers() {
        let collaborator = InMemoryCollaborator::new();
        let bob = id("bob");
        let partition = PartitionResolver::default().resolve("bob", true).expect("p");
        let handle = collaborator.open_partition(&bob, &partition).await.expect("open");
        let mut subscription = collaborator.subscribe_tasks(&handle);
        assert!(subscription.initial.is_empty());

        let task = Task::new(TaskDraft::new("one"), bob.clone(), bob.clone(), Utc::now());
        collaborator
            .upsert_task(&bob, &handle, task.clone())
            .await
            .expect("insert");
        collaborator
            .delete_task(&bob, &handle, task.id)
            .await
            .expect("delete");

        match subscription.events.recv().await.expect("insert event") {
            CollectionEvent::Changed { items, changes } => {
                assert_eq!(items.len(), 1);
                assert_eq!(changes, ChangeSet::inserted(0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match subscription.events.recv().await.expect("delete event") {
            CollectionEvent::Changed { items, changes } => {
                assert!(items.is_empty());
                assert_eq!(changes, ChangeSet::removed(0));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        collaborator.unsubscribe(subscription.token);
        assert_eq!(collaborator.subscriber_count(partition.path()), 0);
    }

    #[tokio::test]
    async fn revoking_with_none_removes_grant() {
        let collaborator = InMemoryCollaborator::new();
        let bob = id("bob");
        let partition = PartitionResolver::default().resolve("bob", true).expect("p");
        collaborator.open_partition(&bob, &partition).await.expect("open");
        let everyone = GrantSubject::Wildcard;

        collaborator
            .apply_grant(&bob, partition.path(), &everyone, AccessLevel::Read)
            .await
            .expect("grant");
        assert_eq!(collaborator.state().grants.len(), 2);

        collaborator
            .apply_grant(&bob, partition.path(), &everyone, AccessLevel::None)
            .await
            .expect("revoke");
        assert_eq!(collaborator.state().grants.len(), 1);
    }

    #[tokio::test]
    async fn owner_access_cannot_be_changed() {
        let collaborator = InMemoryCollaborator::new();
        let bob = id("bob");
        let partition = PartitionResolver::default().resolve("bob", true).expect("p");
        collaborator.open_partition(&bob, &partition).await.expect("open");

        let err = collaborator
            .apply_grant(
                &bob,
                partition.path(),
                &GrantSubject::Identity(bob.clone()),
                AccessLevel::None,
            )
            .await
            .expect_err("rejected");
        assert!(matches!(err, CollaboratorError::Rejected(_)));
    }

    #[tokio::test]
    async fn upsert_person_keeps_first_record() {
        let collaborator = InMemoryCollaborator::new();
        let first = Person::new(id("alice"), Utc::now()).with_name("Alice", "A");
        let second = Person::new(id("alice"), Utc::now()).with_name("Other", "B");

        let stored = collaborator.upsert_person(first.clone()).await.expect("first");
        let again = collaborator.upsert_person(second).await.expect("second");
        assert_eq!(stored, first);
        assert_eq!(again, first);
        assert_eq!(collaborator.people_with_id(&id("alice")), 1);
    }

    #[tokio::test]
    async fn state_round_trips_through_json() {
        let collaborator = InMemoryCollaborator::new();
        let bob = id("bob");
        let partition = PartitionResolver::default().resolve("bob", true).expect("p");
        let handle = collaborator.open_partition(&bob, &partition).await.expect("open");
        collaborator
            .upsert_task(
                &bob,
                &handle,
                Task::new(TaskDraft::new("persist me"), bob.clone(), bob.clone(), Utc::now()),
            )
            .await
            .expect("task");

        let json = serde_json::to_string(&collaborator.state()).expect("serialize");
        let restored: StoreState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, collaborator.state());
        let reopened = InMemoryCollaborator::from_state(restored);
        assert_eq!(reopened.state().partitions["/bob/MyTasks"].tasks.len(), 1);
    }
}
