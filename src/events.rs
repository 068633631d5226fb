//! JSONL activity events for integrations.
//!
//! `--events <path>` appends one JSON object per line for every change a
//! command makes. `--events -` writes them to stdout in place of the
//! command's own output.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use ulid::Ulid;

use crate::error::Result;
use crate::identity::Identity;

pub const EVENT_SCHEMA_VERSION: &str = "shared-tasks.event.v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDestination {
    Stdout,
    File(PathBuf),
}

impl EventDestination {
    /// `None` for a missing or blank flag value.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw?.trim() {
            "" => None,
            "-" => Some(EventDestination::Stdout),
            path => Some(EventDestination::File(PathBuf::from(path))),
        }
    }

    pub fn open(&self) -> Result<EventSink> {
        let writer: Box<dyn Write + Send> = match self {
            EventDestination::Stdout => Box::new(io::stdout()),
            EventDestination::File(path) => Box::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            ),
        };
        Ok(EventSink { writer })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProfileCreated,
    ProfileUpdated,
    PartitionSelected,
    TaskCreated,
    TaskEdited,
    TaskDeleted,
    GrantRequested,
    PermissionsRefreshed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub schema_version: &'static str,
    pub event_id: String,
    pub event: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<Identity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event: EventKind) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            event_id: Ulid::new().to_string(),
            event,
            timestamp: Utc::now(),
            actor: None,
            data: None,
        }
    }

    /// Identity that caused the event.
    pub fn by(mut self, actor: &Identity) -> Self {
        self.actor = Some(actor.clone());
        self
    }

    pub fn with_data<T: Serialize>(mut self, data: T) -> Result<Self> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }
}

/// Writes one event per line and flushes after each.
pub struct EventSink {
    writer: Box<dyn Write + Send>,
}

impl EventSink {
    pub fn emit(&mut self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_and_dash_destinations() {
        assert_eq!(EventDestination::parse(None), None);
        assert_eq!(EventDestination::parse(Some("  ")), None);
        assert_eq!(EventDestination::parse(Some(" - ")), Some(EventDestination::Stdout));
        assert_eq!(
            EventDestination::parse(Some("out/events.jsonl")),
            Some(EventDestination::File(PathBuf::from("out/events.jsonl")))
        );
    }

    #[test]
    fn file_destination_appends_across_sinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let destination = EventDestination::File(dir.path().join("events.jsonl"));
        let bob = Identity::new("bob").expect("identity");

        let created = Event::new(EventKind::TaskCreated)
            .by(&bob)
            .with_data(serde_json::json!({ "title": "Fix the fence" }))
            .expect("data");
        destination.open().expect("open").emit(&created).expect("emit");
        destination
            .open()
            .expect("reopen")
            .emit(&Event::new(EventKind::PermissionsRefreshed))
            .expect("emit");

        let EventDestination::File(path) = &destination else {
            unreachable!()
        };
        let lines: Vec<serde_json::Value> = std::fs::read_to_string(path)
            .expect("read")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "task_created");
        assert_eq!(lines[0]["actor"], "bob");
        assert_eq!(lines[0]["data"]["title"], "Fix the fence");
        assert_eq!(lines[1]["schema_version"], EVENT_SCHEMA_VERSION);
        assert!(lines[1].get("actor").is_none());
        assert_ne!(lines[0]["event_id"], lines[1]["event_id"]);
    }
}
