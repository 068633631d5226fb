//! People directory and the caller's own profile.
//!
//! Every identity has at most one `Person` record in the shared directory
//! partition. The record is created on first login and only ever changed by
//! its owner.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::collaborator::{
    ChangeSet, CollectionEvent, SubscriptionToken, SyncCollaborator,
};
use crate::error::{Error, Result};
use crate::identity::Identity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: Identity,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// PNG bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<Vec<u8>>,
}

impl Person {
    pub fn new(id: Identity, now: DateTime<Utc>) -> Self {
        Self {
            id,
            first_name: String::new(),
            last_name: String::new(),
            created_at: now,
            last_seen: Some(now),
            avatar: None,
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = first.into();
        self.last_name = last.into();
        self
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    /// Full name, or the identity when no name is set.
    pub fn display_name(&self) -> String {
        let full = self.full_name();
        if full.is_empty() {
            self.id.to_string()
        } else {
            full
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_seen
            .map(|seen| now - seen <= window)
            .unwrap_or(false)
    }

    pub fn apply(&mut self, patch: &PersonPatch) {
        match patch {
            PersonPatch::Name { first, last } => {
                self.first_name = first.clone();
                self.last_name = last.clone();
            }
            PersonPatch::Avatar(avatar) => self.avatar = avatar.clone(),
            PersonPatch::LastSeen(seen) => self.last_seen = Some(*seen),
        }
    }
}

/// A change to one's own person record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonPatch {
    Name { first: String, last: String },
    Avatar(Option<Vec<u8>>),
    LastSeen(DateTime<Utc>),
}

/// Directory ordering: last name, then first name, then id.
pub fn sort_people(people: &mut [Person]) {
    people.sort_by(|left, right| {
        left.last_name
            .to_lowercase()
            .cmp(&right.last_name.to_lowercase())
            .then_with(|| {
                left.first_name
                    .to_lowercase()
                    .cmp(&right.first_name.to_lowercase())
            })
            .then_with(|| left.id.cmp(&right.id))
    });
}

/// Index diff between two sorted directory snapshots, keyed by identity.
///
/// Replaying it against `old` (removals by old index, highest first, then
/// insertions by new index, lowest first) yields `new`. A person whose
/// position moved relative to the others is reported as removed and
/// inserted rather than updated.
pub fn diff_people(old: &[Person], new: &[Person]) -> ChangeSet {
    let new_index: HashMap<&Identity, usize> = new
        .iter()
        .enumerate()
        .map(|(index, person)| (&person.id, index))
        .collect();

    // (old index, new index) of everyone present in both, in old order.
    let survivors: Vec<(usize, usize)> = old
        .iter()
        .enumerate()
        .filter_map(|(index, person)| new_index.get(&person.id).map(|&to| (index, to)))
        .collect();
    let positions: Vec<usize> = survivors.iter().map(|&(_, to)| to).collect();
    let stable: HashMap<usize, usize> = longest_increasing_run(&positions)
        .into_iter()
        .map(|at| survivors[at])
        .collect();
    let stable_targets: HashSet<usize> = stable.values().copied().collect();

    let removed = (0..old.len())
        .filter(|index| !stable.contains_key(index))
        .collect();
    let inserted = (0..new.len())
        .filter(|index| !stable_targets.contains(index))
        .collect();
    let mut updated: Vec<usize> = stable
        .iter()
        .filter(|&(&from, &to)| old[from] != new[to])
        .map(|(_, &to)| to)
        .collect();
    updated.sort_unstable();

    ChangeSet {
        inserted,
        removed,
        updated,
    }
}

/// Indexes into `values` of one longest strictly increasing subsequence.
fn longest_increasing_run(values: &[usize]) -> Vec<usize> {
    let mut tails: Vec<usize> = Vec::new();
    let mut parent: Vec<Option<usize>> = vec![None; values.len()];
    for (at, &value) in values.iter().enumerate() {
        let slot = tails.partition_point(|&tail| values[tail] < value);
        if slot > 0 {
            parent[at] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(at);
        } else {
            tails[slot] = at;
        }
    }
    let mut run = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(at) = cursor {
        run.push(at);
        cursor = parent[at];
    }
    run.reverse();
    run
}

pub type PeopleHandler = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

struct DirectoryState {
    people: Arc<Vec<Person>>,
    token: Option<SubscriptionToken>,
    feed: Option<UnboundedReceiver<CollectionEvent<Person>>>,
    handlers: Vec<PeopleHandler>,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Cached roster of people plus the owner's own profile operations.
pub struct ProfileDirectory {
    identity: Identity,
    collaborator: Arc<dyn SyncCollaborator>,
    heartbeat: Duration,
    state: Mutex<DirectoryState>,
}

impl ProfileDirectory {
    pub fn new(
        identity: Identity,
        collaborator: Arc<dyn SyncCollaborator>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            identity,
            collaborator,
            heartbeat,
            state: Mutex::new(DirectoryState {
                people: Arc::new(Vec::new()),
                token: None,
                feed: None,
                handlers: Vec::new(),
                last_heartbeat: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Subscribe to the directory partition, replacing any earlier subscription.
    pub async fn open(&self) -> Result<()> {
        let subscription = self
            .collaborator
            .open_directory(&self.identity)
            .await
            .map_err(Error::Collaborator)?;

        let mut people = subscription.initial;
        sort_people(&mut people);

        let (previous, changes, handlers) = {
            let mut state = self.state();
            let previous = state.token.replace(subscription.token);
            state.feed = Some(subscription.events);
            let changes = diff_people(&state.people, &people);
            state.people = Arc::new(people);
            (previous, changes, state.handlers.clone())
        };
        if let Some(token) = previous {
            self.collaborator.unsubscribe(token);
        }
        tracing::debug!(identity = %self.identity, token = %subscription.token, "directory subscribed");

        notify(&handlers, &changes);
        Ok(())
    }

    /// Drop the directory subscription. Idempotent.
    pub fn close(&self) {
        let token = {
            let mut state = self.state();
            state.feed = None;
            state.token.take()
        };
        if let Some(token) = token {
            self.collaborator.unsubscribe(token);
        }
    }

    pub fn is_open(&self) -> bool {
        self.state().token.is_some()
    }

    /// Everyone in the directory, sorted by last name.
    pub fn all_people(&self) -> Arc<Vec<Person>> {
        Arc::clone(&self.state().people)
    }

    pub fn person_for(&self, identity: &Identity) -> Option<Person> {
        self.state()
            .people
            .iter()
            .find(|person| &person.id == identity)
            .cloned()
    }

    /// Register a handler called after each directory change.
    pub fn on_change<F>(&self, handler: F)
    where
        F: Fn(&ChangeSet) + Send + Sync + 'static,
    {
        self.state().handlers.push(Arc::new(handler));
    }

    /// Create the owner's profile if it does not exist yet.
    ///
    /// Creation goes through the collaborator's upsert, so concurrent calls
    /// observe a single record.
    pub async fn ensure_own_profile(&self) -> Result<Person> {
        let now = Utc::now();
        let person = self
            .collaborator
            .upsert_person(Person::new(self.identity.clone(), now))
            .await
            .map_err(Error::Collaborator)?;
        if person.created_at == now {
            tracing::info!(identity = %self.identity, "created profile");
        }
        self.merge(person.clone());
        Ok(person)
    }

    pub async fn set_name(&self, first: &str, last: &str) -> Result<Person> {
        self.update(PersonPatch::Name {
            first: first.trim().to_string(),
            last: last.trim().to_string(),
        })
        .await
    }

    /// Replace (or clear) the owner's avatar image.
    pub async fn set_avatar(&self, avatar: Option<Vec<u8>>) -> Result<Person> {
        self.update(PersonPatch::Avatar(avatar)).await
    }

    /// Whether a presence write is due at `now`.
    pub fn presence_due(&self, now: DateTime<Utc>) -> bool {
        match self.state().last_heartbeat {
            Some(last) => now - last >= self.heartbeat,
            None => true,
        }
    }

    /// Record that the owner is present. Skips the write when the last one
    /// is more recent than the heartbeat interval.
    pub async fn touch_presence(&self, now: DateTime<Utc>) -> Result<Option<Person>> {
        if !self.presence_due(now) {
            return Ok(None);
        }
        let person = self.update(PersonPatch::LastSeen(now)).await?;
        self.state().last_heartbeat = Some(now);
        Ok(Some(person))
    }

    async fn update(&self, patch: PersonPatch) -> Result<Person> {
        let person = self
            .collaborator
            .update_person(&self.identity, patch)
            .await
            .map_err(Error::Collaborator)?;
        self.merge(person.clone());
        Ok(person)
    }

    fn merge(&self, person: Person) {
        let (changes, handlers) = {
            let mut state = self.state();
            let mut people: Vec<Person> = state
                .people
                .iter()
                .filter(|existing| existing.id != person.id)
                .cloned()
                .collect();
            people.push(person);
            sort_people(&mut people);
            let changes = diff_people(&state.people, &people);
            state.people = Arc::new(people);
            (changes, state.handlers.clone())
        };
        notify(&handlers, &changes);
    }

    /// Apply queued directory notifications and run handlers. Returns the
    /// number of notifications that changed the snapshot.
    pub fn dispatch_pending(&self) -> Result<usize> {
        let mut applied = 0;
        loop {
            let (changes, handlers) = {
                let mut state = self.state();
                let Some(feed) = state.feed.as_mut() else {
                    break;
                };
                let event = match feed.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        tracing::debug!(identity = %self.identity, "directory feed closed");
                        state.feed = None;
                        break;
                    }
                };
                match event {
                    CollectionEvent::Changed { items, .. } => {
                        let mut people = items;
                        sort_people(&mut people);
                        let changes = diff_people(&state.people, &people);
                        state.people = Arc::new(people);
                        (changes, state.handlers.clone())
                    }
                    CollectionEvent::Error(reason) => {
                        tracing::warn!(identity = %self.identity, %reason, "directory notification error");
                        return Err(Error::SubscriptionFailed(reason));
                    }
                }
            };
            if changes.is_empty() {
                continue;
            }
            applied += 1;
            notify(&handlers, &changes);
        }
        Ok(applied)
    }
}

fn notify(handlers: &[PeopleHandler], changes: &ChangeSet) {
    if changes.is_empty() {
        return;
    }
    for handler in handlers {
        handler(changes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(id: &str, first: &str, last: &str) -> Person {
        Person::new(Identity::new(id).expect("identity"), Utc::now()).with_name(first, last)
    }

    #[test]
    fn sorts_by_last_then_first_name() {
        let mut people = vec![
            person("c", "Zoe", "Adams"),
            person("a", "Ann", "Young"),
            person("b", "Al", "Adams"),
        ];
        sort_people(&mut people);
        let ids: Vec<&str> = people.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn display_name_falls_back_to_identity() {
        let unnamed = Person::new(Identity::new("u-1").expect("identity"), Utc::now());
        assert_eq!(unnamed.display_name(), "u-1");
        assert_eq!(person("x", "Ada", "Lovelace").display_name(), "Ada Lovelace");
        assert_eq!(person("y", "Cher", "").full_name(), "Cher");
    }

    #[test]
    fn online_window() {
        let now = Utc::now();
        let mut p = person("a", "A", "B");
        p.last_seen = Some(now - Duration::minutes(20));
        assert!(!p.is_online(now, Duration::minutes(15)));
        p.last_seen = Some(now - Duration::minutes(2));
        assert!(p.is_online(now, Duration::minutes(15)));
        p.last_seen = None;
        assert!(!p.is_online(now, Duration::minutes(15)));
    }

    #[test]
    fn diff_reports_inserts_removals_and_updates() {
        let a = person("a", "A", "Alpha");
        let b = person("b", "B", "Beta");
        let c = person("c", "C", "Gamma");
        let mut b2 = b.clone();
        b2.first_name = "Bee".to_string();

        let old = vec![a.clone(), b];
        let new = vec![b2, c];
        let changes = diff_people(&old, &new);
        assert_eq!(changes.removed, vec![0]);
        assert_eq!(changes.updated, vec![0]);
        assert_eq!(changes.inserted, vec![1]);

        assert!(diff_people(&old, &old).is_empty());
    }

    fn replay(old: &[Person], new: &[Person], changes: &ChangeSet) -> Vec<Person> {
        let mut view = old.to_vec();
        for &index in changes.removed.iter().rev() {
            view.remove(index);
        }
        for &index in &changes.inserted {
            view.insert(index, new[index].clone());
        }
        for &index in &changes.updated {
            view[index] = new[index].clone();
        }
        view
    }

    #[test]
    fn rename_that_reorders_replays_cleanly() {
        let a = person("a", "A", "Alpha");
        let b = person("b", "B", "Beta");
        let mut renamed = a.clone();
        renamed.last_name = "Zeta".to_string();

        let old = vec![a, b];
        let mut new = vec![renamed, old[1].clone()];
        sort_people(&mut new);
        let changes = diff_people(&old, &new);

        assert_eq!(changes.removed, vec![0]);
        assert_eq!(changes.inserted, vec![1]);
        assert!(changes.updated.is_empty());
        assert_eq!(replay(&old, &new, &changes), new);
    }

    #[test]
    fn mixed_moves_and_edits_replay_cleanly() {
        let old = vec![
            person("a", "A", "Adams"),
            person("b", "B", "Baker"),
            person("c", "C", "Clark"),
            person("d", "D", "Davis"),
            person("e", "E", "Evans"),
        ];
        let mut new = old.clone();
        new.retain(|p| p.id.as_str() != "c");
        new[0].last_name = "Young".to_string();
        new[2].first_name = "Dee".to_string();
        new.push(person("f", "F", "Baxter"));
        sort_people(&mut new);

        let changes = diff_people(&old, &new);
        assert_eq!(replay(&old, &new, &changes), new);
        assert_eq!(changes.updated.len(), 1);
    }

    #[test]
    fn patch_application() {
        let now = Utc::now();
        let mut p = person("a", "A", "B");
        p.apply(&PersonPatch::Name {
            first: "Ada".to_string(),
            last: "King".to_string(),
        });
        p.apply(&PersonPatch::Avatar(Some(vec![1, 2, 3])));
        p.apply(&PersonPatch::LastSeen(now));
        assert_eq!(p.full_name(), "Ada King");
        assert_eq!(p.avatar.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(p.last_seen, Some(now));
    }
}
