//! Store directory for the CLI host
//!
//! The CLI runs the in-memory collaborator and persists its contents between
//! invocations.
//!
//! # Directory Structure
//!
//! ```text
//! <store>/
//!   config.toml     # Optional configuration
//!   identity        # Identity saved by `login`
//!   store.json      # People, partitions and grants
//!   store.lock      # fs2 lock held for a whole load-modify-save cycle
//! ```
//!
//! The store root is `--store`, else `SHARED_TASKS_HOME`, else the platform
//! data directory, else `.shared-tasks` in the working directory.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::config::Config;
use crate::error::Result;
use crate::lock::{write_atomic, FileLock, DEFAULT_LOCK_TIMEOUT_MS};
use crate::memory::StoreState;

pub const HOME_ENV: &str = "SHARED_TASKS_HOME";
pub const FALLBACK_DIR: &str = ".shared-tasks";
const STORE_FILENAME: &str = "store.json";
const LOCK_FILENAME: &str = "store.lock";

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Pick the store root from the CLI flag, the environment or the platform.
    pub fn resolve(cli_root: Option<&Path>) -> Self {
        if let Some(root) = cli_root {
            return Self::new(root);
        }
        if let Ok(home) = std::env::var(HOME_ENV) {
            if !home.trim().is_empty() {
                return Self::new(home.trim());
            }
        }
        match ProjectDirs::from("", "", "shared-tasks") {
            Some(dirs) => Self::new(dirs.data_dir()),
            None => Self::new(FALLBACK_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_file(&self) -> PathBuf {
        self.root.join(STORE_FILENAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILENAME)
    }

    pub fn config_file(&self) -> PathBuf {
        Config::path_in(&self.root)
    }

    pub fn load_config(&self) -> Config {
        Config::load_from_dir(&self.root)
    }

    /// Take the store lock. Hold the guard across load and save.
    pub fn lock(&self) -> Result<FileLock> {
        fs::create_dir_all(&self.root)?;
        FileLock::acquire(self.lock_file(), DEFAULT_LOCK_TIMEOUT_MS)
    }

    /// Read the persisted store, or an empty one if none exists yet.
    pub fn load_state(&self) -> Result<StoreState> {
        let path = self.store_file();
        if !path.exists() {
            return Ok(StoreState::default());
        }
        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(StoreState::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_state(&self, state: &StoreState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(self.store_file(), json.as_bytes())?;
        tracing::debug!(path = %self.store_file().display(), "store saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::memory::StoredPartition;
    use tempfile::TempDir;

    #[test]
    fn missing_store_loads_empty() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().join("nested"));
        assert_eq!(storage.load_state().unwrap(), StoreState::default());
    }

    #[test]
    fn saved_state_loads_back() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path());
        let mut state = StoreState::default();
        state.partitions.insert(
            "/alice/MyTasks".to_string(),
            StoredPartition {
                owner: Identity::new("alice").unwrap(),
                tasks: Vec::new(),
            },
        );

        let _guard = storage.lock().unwrap();
        storage.save_state(&state).unwrap();
        assert_eq!(storage.load_state().unwrap(), state);
    }

    #[test]
    fn cli_root_wins() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::resolve(Some(temp.path()));
        assert_eq!(storage.root(), temp.path());
        assert_eq!(storage.config_file(), temp.path().join("config.toml"));
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path());
        fs::write(storage.store_file(), "{not json").unwrap();
        assert!(storage.load_state().is_err());
    }
}
