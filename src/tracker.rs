//! Task collection tracker.
//!
//! Holds the live task collection of the one partition currently selected.
//!
//! ```text
//!   Unbound --bind_to--> Subscribing --opened--> Bound
//!                             |                    |
//!                             +--failed--> Error   +--bind_to--> Subscribing
//!   any --unbind--> Unbound
//! ```
//!
//! Every bind bumps an epoch. The synchronous part of `bind_to` cancels the
//! previous subscription and drops its feed before the new open starts, so
//! nothing from the old partition is delivered afterwards. Open results that
//! arrive for an older epoch are discarded.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::access::AccessLevel;
use crate::collaborator::{
    ChangeSet, CollaboratorError, CollectionEvent, PartitionHandle, SubscriptionToken,
    SyncCollaborator,
};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::partition::PartitionRef;
use crate::permissions::PermissionCache;
use crate::task::{Task, TaskDraft, TaskPatch};

/// Public view of the tracker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerStatus {
    Unbound,
    Subscribing(PartitionRef),
    Bound(PartitionRef),
    Error { partition: PartitionRef, reason: String },
}

impl TrackerStatus {
    pub fn partition(&self) -> Option<&PartitionRef> {
        match self {
            TrackerStatus::Unbound => None,
            TrackerStatus::Subscribing(partition)
            | TrackerStatus::Bound(partition)
            | TrackerStatus::Error { partition, .. } => Some(partition),
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, TrackerStatus::Bound(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrackerStatus::Unbound => "unbound",
            TrackerStatus::Subscribing(_) => "subscribing",
            TrackerStatus::Bound(_) => "bound",
            TrackerStatus::Error { .. } => "error",
        }
    }
}

/// How a bind request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// A later bind or unbind took over before this one finished.
    Superseded,
}

pub type TaskHandler = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

struct TrackerState {
    epoch: u64,
    status: TrackerStatus,
    handle: Option<PartitionHandle>,
    token: Option<SubscriptionToken>,
    feed: Option<UnboundedReceiver<CollectionEvent<Task>>>,
    tasks: Arc<Vec<Task>>,
    handlers: Vec<TaskHandler>,
}

impl TrackerState {
    /// Cancel the live subscription, if any. Returns the token to release.
    fn teardown(&mut self) -> Option<SubscriptionToken> {
        self.feed = None;
        self.handle = None;
        self.tasks = Arc::new(Vec::new());
        self.token.take()
    }
}

pub struct TaskTracker {
    collaborator: Arc<dyn SyncCollaborator>,
    permissions: Arc<PermissionCache>,
    state: Arc<Mutex<TrackerState>>,
}

fn lock(state: &Mutex<TrackerState>) -> MutexGuard<'_, TrackerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskTracker {
    pub fn new(collaborator: Arc<dyn SyncCollaborator>, permissions: Arc<PermissionCache>) -> Self {
        Self {
            collaborator,
            permissions,
            state: Arc::new(Mutex::new(TrackerState {
                epoch: 0,
                status: TrackerStatus::Unbound,
                handle: None,
                token: None,
                feed: None,
                tasks: Arc::new(Vec::new()),
                handlers: Vec::new(),
            })),
        }
    }

    pub fn status(&self) -> TrackerStatus {
        lock(&self.state).status.clone()
    }

    /// Partition currently selected, in any state but `Unbound`.
    pub fn partition(&self) -> Option<PartitionRef> {
        lock(&self.state).status.partition().cloned()
    }

    /// Switch to `partition`.
    ///
    /// The previous subscription is cancelled before this returns; the
    /// returned future completes the open and subscribe.
    pub fn bind_to(
        &self,
        partition: PartitionRef,
        actor: Identity,
    ) -> impl Future<Output = Result<BindOutcome>> + Send + 'static {
        let (epoch, released) = {
            let mut state = lock(&self.state);
            let released = state.teardown();
            state.epoch += 1;
            state.status = TrackerStatus::Subscribing(partition.clone());
            (state.epoch, released)
        };
        if let Some(token) = released {
            self.collaborator.unsubscribe(token);
        }
        tracing::debug!(partition = %partition, %actor, epoch, "binding task partition");

        let collaborator = Arc::clone(&self.collaborator);
        let state = Arc::clone(&self.state);
        async move {
            let opened = collaborator.open_partition(&actor, &partition).await;
            match complete_bind(&state, collaborator.as_ref(), epoch, &partition, opened) {
                Ok(()) => Ok(BindOutcome::Bound),
                Err(Error::StaleSubscription) => {
                    tracing::debug!(partition = %partition, epoch, "discarding superseded open");
                    Ok(BindOutcome::Superseded)
                }
                Err(err) => Err(err),
            }
        }
    }

    /// Drop the current subscription. Idempotent.
    pub fn unbind(&self) {
        let released = {
            let mut state = lock(&self.state);
            if matches!(state.status, TrackerStatus::Unbound) {
                return;
            }
            let released = state.teardown();
            state.epoch += 1;
            state.status = TrackerStatus::Unbound;
            released
        };
        if let Some(token) = released {
            self.collaborator.unsubscribe(token);
        }
        tracing::debug!("task partition unbound");
    }

    /// Snapshot of the current collection. Empty unless bound.
    pub fn current_tasks(&self) -> Arc<Vec<Task>> {
        Arc::clone(&lock(&self.state).tasks)
    }

    pub fn task(&self, id: Uuid) -> Option<Task> {
        lock(&self.state)
            .tasks
            .iter()
            .find(|task| task.id == id)
            .cloned()
    }

    /// Register a handler for collection changes. Handlers run in
    /// registration order from `dispatch_pending`.
    pub fn on_change<F>(&self, handler: F)
    where
        F: Fn(&ChangeSet) + Send + Sync + 'static,
    {
        lock(&self.state).handlers.push(Arc::new(handler));
    }

    /// Apply queued notifications for the bound partition and run handlers.
    ///
    /// Returns the number of changes delivered. A notification error from
    /// the collaborator stops the drain and is returned; the subscription
    /// stays in place.
    pub fn dispatch_pending(&self) -> Result<usize> {
        let mut delivered = 0;
        loop {
            let (changes, handlers) = {
                let mut state = lock(&self.state);
                let Some(feed) = state.feed.as_mut() else {
                    break;
                };
                let event = match feed.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        tracing::debug!("task feed closed by collaborator");
                        state.feed = None;
                        break;
                    }
                };
                match event {
                    CollectionEvent::Changed { items, changes } => {
                        state.tasks = Arc::new(items);
                        (changes, state.handlers.clone())
                    }
                    CollectionEvent::Error(reason) => {
                        tracing::warn!(%reason, "task notification error");
                        return Err(Error::SubscriptionFailed(reason));
                    }
                }
            };
            delivered += 1;
            for handler in &handlers {
                handler(&changes);
            }
        }
        Ok(delivered)
    }

    /// Cached access level of `actor` on the bound partition.
    pub fn access_level(&self, actor: &Identity) -> AccessLevel {
        match self.partition() {
            Some(partition) => self.permissions.access_level(actor, &partition),
            None => AccessLevel::None,
        }
    }

    pub async fn create_task(&self, actor: &Identity, draft: TaskDraft) -> Result<Task> {
        draft.validate()?;
        let handle = self.writable_handle(actor)?;
        let task = Task::new(
            draft,
            handle.partition().owner().clone(),
            actor.clone(),
            Utc::now(),
        );
        let task = self
            .collaborator
            .upsert_task(actor, &handle, task)
            .await
            .map_err(Error::Collaborator)?;
        tracing::debug!(partition = %handle.partition(), task = %task.id, "task created");
        Ok(task)
    }

    pub async fn update_task(&self, actor: &Identity, id: Uuid, patch: TaskPatch) -> Result<Task> {
        patch.validate()?;
        let handle = self.writable_handle(actor)?;
        self.collaborator
            .update_task(actor, &handle, id, patch)
            .await
            .map_err(|err| task_error(err, id))
    }

    pub async fn delete_task(&self, actor: &Identity, id: Uuid) -> Result<()> {
        let handle = self.writable_handle(actor)?;
        self.collaborator
            .delete_task(actor, &handle, id)
            .await
            .map_err(|err| task_error(err, id))?;
        tracing::debug!(partition = %handle.partition(), task = %id, "task deleted");
        Ok(())
    }

    /// Handle of the bound partition, if `actor` may write to it.
    fn writable_handle(&self, actor: &Identity) -> Result<PartitionHandle> {
        let handle = {
            let state = lock(&self.state);
            match (&state.status, &state.handle) {
                (TrackerStatus::Bound(_), Some(handle)) => handle.clone(),
                _ => return Err(Error::NotBound),
            }
        };
        let level = self.permissions.access_level(actor, handle.partition());
        if !level.may_write() {
            return Err(Error::InsufficientAccess {
                subject: actor.to_string(),
                partition: handle.partition().path().to_string(),
                level,
            });
        }
        Ok(handle)
    }
}

impl Drop for TaskTracker {
    fn drop(&mut self) {
        if let Some(token) = lock(&self.state).token.take() {
            self.collaborator.unsubscribe(token);
        }
    }
}

fn complete_bind(
    state: &Mutex<TrackerState>,
    collaborator: &dyn SyncCollaborator,
    epoch: u64,
    partition: &PartitionRef,
    opened: std::result::Result<PartitionHandle, CollaboratorError>,
) -> Result<()> {
    let mut state = lock(state);
    if state.epoch != epoch {
        return Err(Error::StaleSubscription);
    }

    match opened {
        Ok(handle) => {
            let subscription = collaborator.subscribe_tasks(&handle);
            state.tasks = Arc::new(subscription.initial);
            state.feed = Some(subscription.events);
            state.token = Some(subscription.token);
            state.handle = Some(handle);
            state.status = TrackerStatus::Bound(partition.clone());
            tracing::debug!(partition = %partition, token = %subscription.token, "task partition bound");
            Ok(())
        }
        Err(err) => {
            let reason = err.to_string();
            tracing::warn!(partition = %partition, %reason, "failed to open task partition");
            state.status = TrackerStatus::Error {
                partition: partition.clone(),
                reason: reason.clone(),
            };
            Err(Error::PartitionOpenFailed {
                partition: partition.path().to_string(),
                reason,
            })
        }
    }
}

fn task_error(err: CollaboratorError, id: Uuid) -> Error {
    match err {
        CollaboratorError::NotFound(_) => Error::TaskNotFound(id.to_string()),
        other => Error::Collaborator(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::GrantSubject;
    use crate::memory::InMemoryCollaborator;
    use crate::partition::PartitionResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(raw: &str) -> Identity {
        Identity::new(raw).expect("identity")
    }

    struct Fixture {
        memory: Arc<InMemoryCollaborator>,
        resolver: PartitionResolver,
        permissions: Arc<PermissionCache>,
        tracker: TaskTracker,
    }

    impl Fixture {
        fn new(viewer: &str) -> Self {
            let memory = Arc::new(InMemoryCollaborator::new());
            let permissions = Arc::new(PermissionCache::new(id(viewer), memory.clone()));
            let tracker = TaskTracker::new(memory.clone(), Arc::clone(&permissions));
            Self {
                memory,
                resolver: PartitionResolver::default(),
                permissions,
                tracker,
            }
        }

        fn partition(&self, owner: &str, viewer: &str) -> PartitionRef {
            self.resolver
                .resolve_for(&id(owner), &id(viewer))
                .expect("partition")
        }

        /// Create `owner`'s partition and give `subject` a level on it.
        async fn share(&self, owner: &str, subject: &str, level: AccessLevel) {
            let own = self.partition(owner, owner);
            self.memory
                .open_partition(&id(owner), &own)
                .await
                .expect("owner opens");
            self.memory
                .apply_grant(&id(owner), own.path(), &GrantSubject::Identity(id(subject)), level)
                .await
                .expect("grant");
        }
    }

    #[tokio::test]
    async fn binds_own_partition() {
        let fx = Fixture::new("alice");
        let own = fx.partition("alice", "alice");

        let outcome = fx.tracker.bind_to(own.clone(), id("alice")).await.expect("bind");

        assert_eq!(outcome, BindOutcome::Bound);
        assert_eq!(fx.tracker.status(), TrackerStatus::Bound(own.clone()));
        assert!(fx.tracker.current_tasks().is_empty());
        assert_eq!(fx.memory.subscriber_count(own.path()), 1);
    }

    #[tokio::test]
    async fn later_bind_supersedes_pending_one() {
        let fx = Fixture::new("alice");
        fx.share("bob", "alice", AccessLevel::Read).await;
        let own = fx.partition("alice", "alice");
        let bobs = fx.partition("bob", "alice");

        let first = fx.tracker.bind_to(own.clone(), id("alice"));
        let second = fx.tracker.bind_to(bobs.clone(), id("alice"));

        assert_eq!(first.await.expect("first"), BindOutcome::Superseded);
        assert_eq!(second.await.expect("second"), BindOutcome::Bound);
        assert_eq!(fx.tracker.partition(), Some(bobs.clone()));
        assert_eq!(fx.memory.subscriber_count(own.path()), 0);
        assert_eq!(fx.memory.subscriber_count(bobs.path()), 1);
    }

    #[tokio::test]
    async fn unbind_discards_pending_open() {
        let fx = Fixture::new("alice");
        let own = fx.partition("alice", "alice");

        let pending = fx.tracker.bind_to(own.clone(), id("alice"));
        fx.tracker.unbind();
        fx.tracker.unbind();

        assert_eq!(pending.await.expect("pending"), BindOutcome::Superseded);
        assert_eq!(fx.tracker.status(), TrackerStatus::Unbound);
        assert_eq!(fx.memory.subscriber_count(own.path()), 0);
    }

    #[tokio::test]
    async fn switching_stops_old_notifications() {
        let fx = Fixture::new("alice");
        fx.share("bob", "alice", AccessLevel::Read).await;
        let own = fx.partition("alice", "alice");
        fx.tracker.bind_to(own.clone(), id("alice")).await.expect("bind own");
        let own_handle = fx.memory.open_partition(&id("alice"), &own).await.expect("handle");

        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        fx.tracker.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        fx.tracker
            .bind_to(fx.partition("bob", "alice"), id("alice"))
            .await
            .expect("bind bob");
        let task = Task::new(TaskDraft::new("private"), id("alice"), id("alice"), Utc::now());
        fx.memory
            .upsert_task(&id("alice"), &own_handle, task)
            .await
            .expect("write to own");

        assert_eq!(fx.tracker.dispatch_pending().expect("dispatch"), 0);
        assert_eq!(changes.load(Ordering::SeqCst), 0);
        assert!(fx.tracker.current_tasks().is_empty());
    }

    #[tokio::test]
    async fn open_failure_enters_error_state() {
        let fx = Fixture::new("alice");
        let own = fx.partition("alice", "alice");
        fx.memory.fail_opens(own.path(), "connection refused");

        let err = fx.tracker.bind_to(own.clone(), id("alice")).await.expect_err("fails");

        assert!(matches!(err, Error::PartitionOpenFailed { .. }));
        assert!(matches!(fx.tracker.status(), TrackerStatus::Error { .. }));
        assert!(fx.tracker.current_tasks().is_empty());
        assert!(matches!(
            fx.tracker.create_task(&id("alice"), TaskDraft::new("x")).await,
            Err(Error::NotBound)
        ));

        fx.memory.clear_open_failure(own.path());
        let outcome = fx.tracker.bind_to(own, id("alice")).await.expect("retry");
        assert_eq!(outcome, BindOutcome::Bound);
        assert!(matches!(fx.tracker.status(), TrackerStatus::Bound(_)));
    }

    #[tokio::test]
    async fn writes_need_cached_write_access() {
        let fx = Fixture::new("alice");
        let own = fx.partition("alice", "alice");
        fx.tracker.bind_to(own, id("alice")).await.expect("bind");

        let err = fx
            .tracker
            .create_task(&id("alice"), TaskDraft::new("too early"))
            .await
            .expect_err("cache not loaded");
        match err {
            Error::InsufficientAccess { level, .. } => assert_eq!(level, AccessLevel::None),
            other => panic!("unexpected error: {other:?}"),
        }

        fx.permissions.refresh().await.expect("refresh");
        let task = fx
            .tracker
            .create_task(&id("alice"), TaskDraft::new("Buy milk"))
            .await
            .expect("create");
        assert_eq!(task.created_by, id("alice"));

        assert_eq!(fx.tracker.dispatch_pending().expect("dispatch"), 1);
        assert_eq!(fx.tracker.current_tasks().len(), 1);
        assert_eq!(fx.tracker.task(task.id), Some(task));
    }

    #[tokio::test]
    async fn read_grant_blocks_mutations_before_the_collaborator() {
        let fx = Fixture::new("alice");
        fx.share("bob", "alice", AccessLevel::Read).await;
        fx.permissions.refresh().await.expect("refresh");
        fx.tracker
            .bind_to(fx.partition("bob", "alice"), id("alice"))
            .await
            .expect("bind");

        let err = fx
            .tracker
            .delete_task(&id("alice"), Uuid::new_v4())
            .await
            .expect_err("read only");
        match err {
            Error::InsufficientAccess {
                subject,
                partition,
                level,
            } => {
                assert_eq!(subject, "alice");
                assert_eq!(partition, "/bob/MyTasks");
                assert_eq!(level, AccessLevel::Read);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn editing_unknown_task_is_not_found() {
        let fx = Fixture::new("alice");
        fx.tracker
            .bind_to(fx.partition("alice", "alice"), id("alice"))
            .await
            .expect("bind");
        fx.permissions.refresh().await.expect("refresh");

        let missing = Uuid::new_v4();
        let err = fx
            .tracker
            .update_task(&id("alice"), missing, TaskPatch::title("renamed"))
            .await
            .expect_err("missing");
        assert!(matches!(err, Error::TaskNotFound(raw) if raw == missing.to_string()));
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let fx = Fixture::new("alice");
        fx.tracker
            .bind_to(fx.partition("alice", "alice"), id("alice"))
            .await
            .expect("bind");
        fx.permissions.refresh().await.expect("refresh");

        let calls = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let calls = Arc::clone(&calls);
            fx.tracker.on_change(move |changes| {
                calls.lock().unwrap().push((name, changes.clone()));
            });
        }
        fx.tracker
            .create_task(&id("alice"), TaskDraft::new("one"))
            .await
            .expect("create");
        fx.tracker.dispatch_pending().expect("dispatch");

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                ("first", ChangeSet::inserted(0)),
                ("second", ChangeSet::inserted(0)),
            ]
        );
    }

    #[tokio::test]
    async fn notification_error_keeps_subscription() {
        let fx = Fixture::new("alice");
        let own = fx.partition("alice", "alice");
        fx.tracker.bind_to(own.clone(), id("alice")).await.expect("bind");
        fx.permissions.refresh().await.expect("refresh");

        fx.memory.push_error(own.path(), "stream reset");
        let err = fx.tracker.dispatch_pending().expect_err("error surfaced");
        assert!(matches!(err, Error::SubscriptionFailed(reason) if reason == "stream reset"));
        assert!(fx.tracker.status().is_bound());

        fx.tracker
            .create_task(&id("alice"), TaskDraft::new("still live"))
            .await
            .expect("create");
        assert_eq!(fx.tracker.dispatch_pending().expect("dispatch"), 1);
        assert_eq!(fx.tracker.current_tasks().len(), 1);
    }
}
