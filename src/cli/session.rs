//! One CLI invocation's view of the store.
//!
//! A session holds the store lock from load to save, runs the in-memory
//! collaborator over the persisted contents and drives a `Router` on a
//! current-thread runtime, which plays the part of the UI thread.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::cli::GlobalOptions;
use crate::collaborator::SyncCollaborator;
use crate::config::Config;
use crate::error::Result;
use crate::events::{Event, EventDestination, EventKind, EventSink};
use crate::identity::{resolve_identity, Identity};
use crate::lock::FileLock;
use crate::memory::InMemoryCollaborator;
use crate::output::OutputOptions;
use crate::people::Person;
use crate::router::Router;
use crate::storage::Storage;

/// Run `future` to completion on a fresh current-thread runtime.
pub fn block_on<F, T>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(future)
}

pub struct Session {
    pub storage: Storage,
    pub config: Config,
    pub router: Router,
    collaborator: Arc<InMemoryCollaborator>,
    new_profile: bool,
    events: Option<EventSink>,
    events_to_stdout: bool,
    json: bool,
    quiet: bool,
    warnings: Vec<String>,
    _lock: FileLock,
}

impl Session {
    /// Lock the store and load it. `identity` overrides normal resolution.
    pub fn open(globals: &GlobalOptions, identity: Option<&str>) -> Result<Self> {
        let storage = Storage::resolve(globals.store.as_deref());
        let lock = storage.lock()?;
        let config = storage.load_config();
        let identity = resolve_identity(
            Some(storage.root()),
            identity.or(globals.identity.as_deref()),
            &config,
        )?;

        let admins = config
            .permissions
            .admins
            .iter()
            .filter_map(|raw| match Identity::new(raw) {
                Ok(admin) => Some(admin),
                Err(err) => {
                    tracing::warn!(admin = %raw, error = %err, "ignoring invalid admin");
                    None
                }
            })
            .collect::<Vec<_>>();
        let collaborator = Arc::new(
            InMemoryCollaborator::from_state(storage.load_state()?).with_admins(admins),
        );
        let new_profile = collaborator.people_with_id(&identity) == 0;
        let shared: Arc<dyn SyncCollaborator> = Arc::clone(&collaborator) as Arc<dyn SyncCollaborator>;
        let router = Router::new(identity, &config, shared)?;

        let destination = EventDestination::parse(globals.events.as_deref());
        let events = destination.as_ref().map(|dest| dest.open()).transpose()?;
        let events_to_stdout = matches!(destination, Some(EventDestination::Stdout));

        Ok(Self {
            storage,
            config,
            router,
            collaborator,
            new_profile,
            events,
            events_to_stdout,
            json: globals.json,
            quiet: globals.quiet,
            warnings: Vec::new(),
            _lock: lock,
        })
    }

    pub fn identity(&self) -> &Identity {
        self.router.identity()
    }

    /// Sign in: profile, directory, own partition, permissions, presence.
    pub async fn start(&mut self) -> Result<Person> {
        let mut profile = self.router.start().await?;
        if self.new_profile {
            self.emit(EventKind::ProfileCreated, &profile);
        }
        if let Some(updated) = self.router.profile().touch_presence(Utc::now()).await? {
            profile = updated;
        }
        Ok(profile)
    }

    /// Switch to `owner`'s partition, or stay on your own when `None`.
    pub async fn select_owner(&mut self, owner: Option<&str>) -> Result<Identity> {
        let owner = match owner {
            Some(raw) => Identity::new(raw)?,
            None => return Ok(self.identity().clone()),
        };
        if &owner != self.identity() {
            self.router.select(&owner)?.await?;
            let path = self.router.selected().map(|partition| partition.path().to_string());
            self.emit(
                EventKind::PartitionSelected,
                serde_json::json!({ "owner": owner.as_str(), "path": path }),
            );
        }
        Ok(owner)
    }

    /// Record an event on the `--events` sink. Failures become warnings.
    pub fn emit<T: Serialize>(&mut self, kind: EventKind, data: T) {
        let Some(sink) = self.events.as_mut() else {
            return;
        };
        let event = match Event::new(kind).by(self.router.identity()).with_data(data) {
            Ok(event) => event,
            Err(err) => {
                self.warnings.push(format!("event output failed: {err}"));
                return;
            }
        };
        if let Err(err) = sink.emit(&event) {
            self.warnings.push(format!("event output failed: {err}"));
        }
    }

    pub fn output(&self) -> OutputOptions {
        OutputOptions {
            json: self.json && !self.events_to_stdout,
            quiet: self.quiet || self.events_to_stdout,
        }
    }

    /// Deliver queued notifications, close subscriptions and persist the
    /// store. Returns warnings collected along the way.
    pub fn finish(mut self) -> Result<Vec<String>> {
        if let Err(err) = self.router.dispatch_pending() {
            self.warnings.push(format!("notification error: {err}"));
        }
        self.router.shutdown();
        self.storage.save_state(&self.collaborator.state())?;
        Ok(self.warnings)
    }
}
