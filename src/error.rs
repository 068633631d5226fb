//! Errors and the exit codes the CLI maps them to.
//!
//! - 0: success
//! - 2: the caller asked for something malformed or missing
//! - 3: the caller lacks access
//! - 4: the store, the sync collaborator or the filesystem failed

use std::path::PathBuf;
use thiserror::Error;

use crate::access::AccessLevel;
use crate::collaborator::CollaboratorError;

pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const POLICY_BLOCKED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

#[derive(Error, Debug)]
pub enum Error {
    // exit 2
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("bad config: {0}")]
    InvalidConfig(String),

    #[error("bad argument: {0}")]
    InvalidArgument(String),

    #[error("no task list is selected")]
    NotBound,

    #[error("no task with id {0}")]
    TaskNotFound(String),

    // exit 3
    #[error("{subject} has {level} access to {partition}")]
    InsufficientAccess {
        subject: String,
        partition: String,
        level: AccessLevel,
    },

    // exit 4
    #[error("could not open {partition}: {reason}")]
    PartitionOpenFailed { partition: String, reason: String },

    #[error("could not grant {level} to {subject} on {partition}: {reason}")]
    GrantApplyFailed {
        partition: String,
        subject: String,
        level: AccessLevel,
        reason: String,
    },

    #[error("could not fetch permissions: {0}")]
    PermissionFetchFailed(String),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Result of work that was abandoned by a later bind. Never surfaced.
    #[error("stale subscription result")]
    StaleSubscription,

    #[error("sync collaborator: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config write: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("store is locked: {0}")]
    LockFailed(PathBuf),

    #[error("{0}")]
    OperationFailed(String),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidIdentity(_)
            | Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::NotBound
            | Error::TaskNotFound(_) => exit_codes::USER_ERROR,
            Error::InsufficientAccess { .. } => exit_codes::POLICY_BLOCKED,
            Error::PartitionOpenFailed { .. }
            | Error::GrantApplyFailed { .. }
            | Error::PermissionFetchFailed(_)
            | Error::SubscriptionFailed(_)
            | Error::StaleSubscription
            | Error::Collaborator(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::LockFailed(_)
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Stable machine-readable kind for JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidIdentity(_) => "invalid_identity",
            Error::InvalidConfig(_) => "invalid_config",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotBound => "not_bound",
            Error::TaskNotFound(_) => "task_not_found",
            Error::InsufficientAccess { .. } => "insufficient_access",
            Error::PartitionOpenFailed { .. } => "partition_open_failed",
            Error::GrantApplyFailed { .. } => "grant_apply_failed",
            Error::PermissionFetchFailed(_) => "permission_fetch_failed",
            Error::SubscriptionFailed(_) => "subscription_failed",
            Error::StaleSubscription => "stale_subscription",
            Error::Collaborator(_) => "collaborator",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::TomlParse(_) | Error::TomlSerialize(_) => "toml",
            Error::LockFailed(_) => "lock_failed",
            Error::OperationFailed(_) => "operation_failed",
        }
    }

    /// Structured details for errors that carry fields
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::InsufficientAccess {
                subject,
                partition,
                level,
            } => Some(serde_json::json!({
                "subject": subject,
                "partition": partition,
                "level": level.as_str(),
            })),
            Error::PartitionOpenFailed { partition, reason } => Some(serde_json::json!({
                "partition": partition,
                "reason": reason,
            })),
            Error::GrantApplyFailed {
                partition,
                subject,
                level,
                reason,
            } => Some(serde_json::json!({
                "partition": partition,
                "subject": subject,
                "level": level.as_str(),
                "reason": reason,
            })),
            Error::InvalidIdentity(message)
            | Error::InvalidConfig(message)
            | Error::InvalidArgument(message) => Some(serde_json::json!({
                "message": message,
            })),
            Error::LockFailed(path) => Some(serde_json::json!({
                "path": path.display().to_string(),
            })),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Flat error form for callers that only need message, code and details.
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        Self {
            error: err.to_string(),
            code: err.exit_code(),
            details: err.details(),
        }
    }
}
