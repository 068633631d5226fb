//! shared-tasks - Access-Scoped Task Router
//!
//! Every user owns a private task partition on a sync service and can let
//! other users read, write or administer it. This library decides which
//! partition an identity maps to, caches who may do what, and keeps a live
//! view of the selected partition's tasks and of the people directory.
//!
//! # Core Concepts
//!
//! - **Partitions**: per-user slices of the shared store, addressed through a
//!   path template such as `/~/MyTasks`
//! - **Grants**: (subject, partition, level) rules with levels
//!   none < read < write < admin
//! - **Tracker**: the one live task subscription, switched atomically
//! - **Directory**: the roster of people and the caller's own profile
//!
//! # Module Organization
//!
//! - `access`: Access levels, grants and grant snapshots
//! - `cli`: Command-line interface using clap
//! - `collaborator`: Contract with the external sync service
//! - `config`: Configuration loading from `config.toml`
//! - `error`: Error types and result aliases
//! - `events`: JSONL event output for integrations
//! - `identity`: Identity values and resolution
//! - `lock`: File locking and atomic writes
//! - `memory`: In-process collaborator
//! - `output`: Human and JSON output formatting
//! - `partition`: Identity to partition resolution
//! - `people`: People directory and own profile
//! - `permissions`: Permission cache
//! - `router`: Entry point tying the pieces together
//! - `storage`: Store directory layout and persistence
//! - `task`: Task records and patches
//! - `tracker`: Live task collection state machine

pub mod access;
pub mod cli;
pub mod collaborator;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod lock;
pub mod memory;
pub mod output;
pub mod partition;
pub mod people;
pub mod permissions;
pub mod router;
pub mod storage;
pub mod task;
pub mod tracker;

pub use error::{Error, Result};
