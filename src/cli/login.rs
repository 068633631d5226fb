//! shared-tasks login, logout and whoami commands

use std::path::PathBuf;

use serde::Serialize;

use crate::cli::session::{block_on, Session};
use crate::cli::GlobalOptions;
use crate::error::Result;
use crate::events::EventKind;
use crate::identity::{persist_identity, remove_persisted_identity, resolve_identity, Identity};
use crate::output::{emit_success, HumanOutput, OutputOptions};
use crate::storage::Storage;

pub struct LoginOptions {
    pub identity: String,
    pub first: Option<String>,
    pub last: Option<String>,
    pub globals: GlobalOptions,
}

#[derive(Serialize)]
struct LoginReport {
    identity: String,
    display_name: String,
    store: PathBuf,
    partition: Option<String>,
}

#[derive(Serialize)]
struct LogoutReport {
    /// Identity that was remembered, if any
    identity: Option<String>,
    store: PathBuf,
}

#[derive(Serialize)]
struct WhoamiReport {
    identity: String,
    store: PathBuf,
}

pub fn run_login(options: LoginOptions) -> Result<()> {
    let identity = Identity::new(&options.identity)?;
    let mut session = Session::open(&options.globals, Some(identity.as_str()))?;

    let profile = block_on(async {
        let mut profile = session.start().await?;
        if options.first.is_some() || options.last.is_some() {
            let first = options.first.as_deref().unwrap_or(&profile.first_name).to_string();
            let last = options.last.as_deref().unwrap_or(&profile.last_name).to_string();
            profile = session.router.profile().set_name(&first, &last).await?;
            session.emit(EventKind::ProfileUpdated, &profile);
        }
        Ok(profile)
    })?;
    persist_identity(session.storage.root(), &identity)?;

    let report = LoginReport {
        identity: identity.to_string(),
        display_name: profile.display_name(),
        store: session.storage.root().to_path_buf(),
        partition: session.router.selected_url(),
    };
    let output = session.output();
    let warnings = session.finish()?;

    let mut human = HumanOutput::new(format!("Signed in as {}", report.display_name));
    human.push_summary("identity", report.identity.clone());
    human.push_summary("store", report.store.display().to_string());
    if let Some(url) = &report.partition {
        human.push_summary("tasks", url.clone());
    }
    for warning in warnings {
        human.push_warning(warning);
    }
    human.push_next_step("shared-tasks task new <title>");

    emit_success(output, "login", &report, Some(&human))
}

pub fn run_logout(globals: GlobalOptions) -> Result<()> {
    let storage = Storage::resolve(globals.store.as_deref());
    let previous = {
        let _lock = storage.lock()?;
        remove_persisted_identity(storage.root())?
    };
    tracing::info!(identity = ?previous, "logged out");

    let report = LogoutReport {
        identity: previous.as_ref().map(ToString::to_string),
        store: storage.root().to_path_buf(),
    };

    let mut human = HumanOutput::new(match &previous {
        Some(identity) => format!("Signed out {identity}"),
        None => "Nobody was signed in".to_string(),
    });
    human.push_summary("store", report.store.display().to_string());
    human.push_next_step("shared-tasks login <identity>");

    emit_success(
        OutputOptions {
            json: globals.json,
            quiet: globals.quiet,
        },
        "logout",
        &report,
        Some(&human),
    )
}

pub fn run_whoami(globals: GlobalOptions) -> Result<()> {
    let storage = Storage::resolve(globals.store.as_deref());
    let config = storage.load_config();
    let identity = resolve_identity(Some(storage.root()), globals.identity.as_deref(), &config)?;

    let report = WhoamiReport {
        identity: identity.to_string(),
        store: storage.root().to_path_buf(),
    };

    let mut human = HumanOutput::new(format!("shared-tasks whoami: {identity}"));
    human.push_summary("store", report.store.display().to_string());

    emit_success(
        OutputOptions {
            json: globals.json,
            quiet: globals.quiet,
        },
        "whoami",
        &report,
        Some(&human),
    )
}
