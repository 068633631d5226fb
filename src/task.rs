//! Task records.
//!
//! A task lives in exactly one owner's partition. `created_by` names that
//! owner; `last_updated_by` names whoever wrote it last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::Identity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub created_by: Identity,
    pub last_updated_by: Identity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    pub title: String,
    #[serde(default)]
    pub details: String,
}

impl Task {
    /// Build a new task for `owner`'s partition, authored by `author`.
    pub fn new(draft: TaskDraft, owner: Identity, author: Identity, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_by: owner,
            last_updated_by: author,
            created_at: now,
            updated_at: now,
            due_at: draft.due_at,
            title: draft.title,
            details: draft.details,
        }
    }

    /// Apply a patch, stamping the editor and update time.
    pub fn apply(&mut self, patch: &TaskPatch, editor: &Identity, now: DateTime<Utc>) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(details) = &patch.details {
            self.details = details.clone();
        }
        if let Some(due_at) = patch.due_at {
            self.due_at = due_at;
        }
        self.last_updated_by = editor.clone();
        self.updated_at = now;
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.due_at.map(|due| due < now).unwrap_or(false)
    }
}

/// Initial values for a new task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_due(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::InvalidArgument("task title cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Field-by-field change to an existing task. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// `Some(None)` clears the due date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn details(details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::default()
        }
    }

    pub fn due(due_at: Option<DateTime<Utc>>) -> Self {
        Self {
            due_at: Some(due_at),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.details.is_none() && self.due_at.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidArgument("task patch changes nothing".to_string()));
        }
        if let Some(title) = &self.title {
            if title.trim().is_empty() {
                return Err(Error::InvalidArgument("task title cannot be empty".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn id(raw: &str) -> Identity {
        Identity::new(raw).expect("identity")
    }

    #[test]
    fn new_task_records_owner_and_author() {
        let now = Utc::now();
        let task = Task::new(TaskDraft::new("Buy milk"), id("bob"), id("alice"), now);
        assert_eq!(task.created_by, id("bob"));
        assert_eq!(task.last_updated_by, id("alice"));
        assert_eq!(task.created_at, now);
        assert_eq!(task.updated_at, now);
        assert_eq!(task.title, "Buy milk");
        assert!(task.details.is_empty());
    }

    #[test]
    fn apply_patch_stamps_editor() {
        let created = Utc::now();
        let mut task = Task::new(TaskDraft::new("Draft"), id("bob"), id("bob"), created);
        let later = created + Duration::minutes(5);
        let due = created + Duration::days(1);

        let patch = TaskPatch::title("Final").with_details("ship it");
        task.apply(&patch, &id("alice"), later);
        task.apply(&TaskPatch::due(Some(due)), &id("alice"), later);

        assert_eq!(task.title, "Final");
        assert_eq!(task.details, "ship it");
        assert_eq!(task.due_at, Some(due));
        assert_eq!(task.last_updated_by, id("alice"));
        assert_eq!(task.updated_at, later);
        assert_eq!(task.created_at, created);

        task.apply(&TaskPatch::due(None), &id("bob"), later);
        assert_eq!(task.due_at, None);
        assert_eq!(task.title, "Final");
    }

    #[test]
    fn empty_patch_and_blank_title_rejected() {
        assert!(matches!(
            TaskPatch::default().validate(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            TaskPatch::title("  ").validate(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            TaskDraft::new("").validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn overdue_only_with_past_due_date() {
        let now = Utc::now();
        let mut task = Task::new(TaskDraft::new("x"), id("bob"), id("bob"), now);
        assert!(!task.is_overdue(now));
        task.due_at = Some(now - Duration::hours(1));
        assert!(task.is_overdue(now));
    }
}
