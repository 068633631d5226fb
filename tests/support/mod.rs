#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use assert_cmd::Command;
use shared_tasks::config::Config;
use shared_tasks::identity::Identity;
use shared_tasks::memory::InMemoryCollaborator;
use shared_tasks::router::Router;

pub fn id(raw: &str) -> Identity {
    Identity::new(raw).expect("identity")
}

/// One in-memory sync service shared by several signed-in routers.
pub struct World {
    pub memory: Arc<InMemoryCollaborator>,
    pub config: Config,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let admins = config
            .permissions
            .admins
            .iter()
            .map(|raw| id(raw))
            .collect::<Vec<_>>();
        Self {
            memory: Arc::new(InMemoryCollaborator::new().with_admins(admins)),
            config,
        }
    }

    /// A router for `who` that has not signed in yet.
    pub fn router(&self, who: &str) -> Router {
        Router::new(id(who), &self.config, self.memory.clone()).expect("router")
    }

    /// A router for `who` after the full sign-in sequence.
    pub async fn signed_in(&self, who: &str) -> Router {
        let router = self.router(who);
        router.start().await.expect("start");
        router
    }
}

pub fn cli(store: &Path) -> Command {
    let mut cmd = Command::cargo_bin("shared-tasks").expect("binary");
    cmd.arg("--store")
        .arg(store)
        .env_remove("SHARED_TASKS_IDENTITY")
        .env_remove("SHARED_TASKS_HOME")
        .env_remove("RUST_LOG");
    cmd
}
