use std::path::PathBuf;

use shared_tasks::access::AccessLevel;
use shared_tasks::collaborator::CollaboratorError;
use shared_tasks::error::{exit_codes, Error, JsonError};

#[test]
fn exit_codes_map_correctly() {
    let user = Error::InvalidIdentity("".to_string());
    assert_eq!(user.exit_code(), exit_codes::USER_ERROR);
    assert_eq!(Error::NotBound.exit_code(), exit_codes::USER_ERROR);

    let policy = Error::InsufficientAccess {
        subject: "carol".to_string(),
        partition: "/bob/MyTasks".to_string(),
        level: AccessLevel::Read,
    };
    assert_eq!(policy.exit_code(), exit_codes::POLICY_BLOCKED);

    let op = Error::PartitionOpenFailed {
        partition: "/bob/MyTasks".to_string(),
        reason: "unauthorized".to_string(),
    };
    assert_eq!(op.exit_code(), exit_codes::OPERATION_FAILED);
    let remote = Error::from(CollaboratorError::Unavailable("down".to_string()));
    assert_eq!(remote.exit_code(), exit_codes::OPERATION_FAILED);
}

#[test]
fn kinds_are_stable() {
    assert_eq!(Error::TaskNotFound("x".to_string()).kind(), "task_not_found");
    assert_eq!(Error::StaleSubscription.kind(), "stale_subscription");
    assert_eq!(
        Error::LockFailed(PathBuf::from("store.lock")).kind(),
        "lock_failed"
    );
}

#[test]
fn json_error_includes_code_and_details() {
    let err = Error::InsufficientAccess {
        subject: "carol".to_string(),
        partition: "/bob/MyTasks".to_string(),
        level: AccessLevel::Read,
    };
    let json = JsonError::from(&err);
    assert_eq!(json.code, exit_codes::POLICY_BLOCKED);
    assert!(json.error.contains("carol has read access"));
    let details = json.details.expect("details");
    assert_eq!(details["level"], "read");
    assert_eq!(details["partition"], "/bob/MyTasks");

    let plain = JsonError::from(&Error::NotBound);
    assert!(plain.details.is_none());
}
