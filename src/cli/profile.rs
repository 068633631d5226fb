//! shared-tasks profile and people commands

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cli::session::{block_on, Session};
use crate::cli::GlobalOptions;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::output::{emit_success, HumanOutput};
use crate::people::Person;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

pub struct SetNameOptions {
    pub first: String,
    pub last: String,
    pub globals: GlobalOptions,
}

pub struct SetAvatarOptions {
    /// `None` clears the avatar
    pub path: Option<PathBuf>,
    pub globals: GlobalOptions,
}

pub struct PeopleOptions {
    pub online: bool,
    pub globals: GlobalOptions,
}

#[derive(Serialize)]
struct PersonReport {
    id: String,
    first_name: String,
    last_name: String,
    display_name: String,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen: Option<DateTime<Utc>>,
    avatar_bytes: usize,
    online: bool,
}

impl PersonReport {
    fn new(person: &Person, online: bool) -> Self {
        Self {
            id: person.id.to_string(),
            first_name: person.first_name.clone(),
            last_name: person.last_name.clone(),
            display_name: person.display_name(),
            created_at: person.created_at,
            last_seen: person.last_seen,
            avatar_bytes: person.avatar.as_ref().map(Vec::len).unwrap_or(0),
            online,
        }
    }
}

#[derive(Serialize)]
struct PeopleReport {
    total: usize,
    people: Vec<PersonReport>,
}

pub fn run_show(globals: GlobalOptions) -> Result<()> {
    let mut session = Session::open(&globals, None)?;
    let profile = block_on(session.start())?;
    let window = session.config.presence.window()?;
    let report = PersonReport::new(&profile, profile.is_online(Utc::now(), window));
    finish_profile(session, "profile show", report)
}

pub fn run_set_name(options: SetNameOptions) -> Result<()> {
    if options.first.trim().is_empty() && options.last.trim().is_empty() {
        return Err(Error::InvalidArgument("name cannot be empty".to_string()));
    }
    let mut session = Session::open(&options.globals, None)?;
    let profile = block_on(async {
        session.start().await?;
        let profile = session
            .router
            .profile()
            .set_name(&options.first, &options.last)
            .await?;
        session.emit(EventKind::ProfileUpdated, &PersonReport::new(&profile, true));
        Ok(profile)
    })?;
    finish_profile(session, "profile set-name", PersonReport::new(&profile, true))
}

pub fn run_set_avatar(options: SetAvatarOptions) -> Result<()> {
    let avatar = match &options.path {
        Some(path) => Some(read_png(path)?),
        None => None,
    };
    let mut session = Session::open(&options.globals, None)?;
    let profile = block_on(async {
        session.start().await?;
        let profile = session.router.profile().set_avatar(avatar).await?;
        session.emit(EventKind::ProfileUpdated, &PersonReport::new(&profile, true));
        Ok(profile)
    })?;
    finish_profile(session, "profile set-avatar", PersonReport::new(&profile, true))
}

pub fn run_people(options: PeopleOptions) -> Result<()> {
    let mut session = Session::open(&options.globals, None)?;
    block_on(session.start())?;

    let now = Utc::now();
    let window = session.config.presence.window()?;
    let people: Vec<PersonReport> = session
        .router
        .people()
        .iter()
        .map(|person| PersonReport::new(person, person.is_online(now, window)))
        .filter(|report| !options.online || report.online)
        .collect();
    let report = PeopleReport {
        total: people.len(),
        people,
    };

    let output = session.output();
    let warnings = session.finish()?;

    let mut human = HumanOutput::new(if options.online {
        format!("People online: {}", report.total)
    } else {
        format!("People: {}", report.total)
    });
    for person in &report.people {
        let marker = if person.online { " (online)" } else { "" };
        human.push_detail(format!("{} [{}]{}", person.display_name, person.id, marker));
    }
    for warning in warnings {
        human.push_warning(warning);
    }

    emit_success(output, "people", &report, Some(&human))
}

fn finish_profile(session: Session, command: &str, report: PersonReport) -> Result<()> {
    let output = session.output();
    let warnings = session.finish()?;

    let mut human = HumanOutput::new(format!("Profile: {}", report.display_name));
    human.push_summary("identity", report.id.clone());
    if !report.first_name.is_empty() || !report.last_name.is_empty() {
        human.push_summary("name", format!("{} {}", report.first_name, report.last_name).trim().to_string());
    } else {
        human.push_next_step("shared-tasks profile set-name <first> <last>");
    }
    if let Some(seen) = report.last_seen {
        human.push_summary("last seen", seen.to_rfc3339());
    }
    if report.avatar_bytes > 0 {
        human.push_summary("avatar", format!("{} bytes", report.avatar_bytes));
    }
    for warning in warnings {
        human.push_warning(warning);
    }

    emit_success(output, command, &report, Some(&human))
}

fn read_png(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)?;
    if !bytes.starts_with(PNG_SIGNATURE) {
        return Err(Error::InvalidArgument(format!(
            "{} is not a PNG image",
            path.display()
        )));
    }
    Ok(bytes)
}
