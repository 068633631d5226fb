//! shared-tasks access, grant and grants commands

use serde::Serialize;

use crate::access::AccessLevel;
use crate::cli::session::{block_on, Session};
use crate::cli::GlobalOptions;
use crate::error::Result;
use crate::events::EventKind;
use crate::identity::{GrantSubject, Identity};
use crate::output::{emit_success, HumanOutput};

pub struct AccessOptions {
    pub owner: Option<String>,
    pub subject: Option<String>,
    pub globals: GlobalOptions,
}

pub struct GrantOptions {
    pub subject: String,
    pub level: String,
    pub owner: Option<String>,
    pub globals: GlobalOptions,
}

#[derive(Serialize)]
struct AccessReport {
    subject: String,
    owner: String,
    partition: String,
    url: String,
    level: AccessLevel,
}

#[derive(Serialize)]
struct GrantReport {
    subject: String,
    owner: String,
    partition: String,
    requested: AccessLevel,
    /// Level after refreshing, for identity subjects
    #[serde(skip_serializing_if = "Option::is_none")]
    effective: Option<AccessLevel>,
}

#[derive(Serialize)]
struct GrantEntry {
    subject: String,
    path: String,
    level: AccessLevel,
}

#[derive(Serialize)]
struct GrantsReport {
    total: usize,
    fetched_at: Option<chrono::DateTime<chrono::Utc>>,
    grants: Vec<GrantEntry>,
}

pub fn run_access(options: AccessOptions) -> Result<()> {
    let owner = options.owner.as_deref().map(Identity::new).transpose()?;
    let subject = options.subject.as_deref().map(Identity::new).transpose()?;

    let mut session = Session::open(&options.globals, None)?;
    block_on(session.start())?;

    let me = session.identity().clone();
    let owner = owner.unwrap_or_else(|| me.clone());
    let subject = subject.unwrap_or_else(|| me.clone());
    let partition = session.router.resolver().resolve_for(&owner, &me)?;
    let report = AccessReport {
        subject: subject.to_string(),
        owner: owner.to_string(),
        partition: partition.path().to_string(),
        url: partition.sync_url(&session.config.server),
        level: session.router.access_level(&subject, &owner)?,
    };

    let output = session.output();
    let warnings = session.finish()?;

    let mut human = HumanOutput::new(format!(
        "{} has {} access to {}",
        report.subject, report.level, report.partition
    ));
    human.push_summary("owner", report.owner.clone());
    human.push_summary("url", report.url.clone());
    for warning in warnings {
        human.push_warning(warning);
    }
    if !report.level.may_read() && report.owner != report.subject {
        human.push_next_step(format!(
            "ask {} to run: shared-tasks grant {} read",
            report.owner, report.subject
        ));
    }

    emit_success(output, "access", &report, Some(&human))
}

pub fn run_grant(options: GrantOptions) -> Result<()> {
    let subject: GrantSubject = options.subject.parse()?;
    let level: AccessLevel = options.level.parse()?;
    let owner = options.owner.as_deref().map(Identity::new).transpose()?;

    let mut session = Session::open(&options.globals, None)?;
    let report = block_on(async {
        session.start().await?;
        let me = session.identity().clone();
        let owner = owner.unwrap_or_else(|| me.clone());
        let partition = session.router.resolver().resolve_for(&owner, &me)?;

        session.router.grant_access(&owner, &subject, level).await?;
        session.emit(
            EventKind::GrantRequested,
            serde_json::json!({
                "subject": subject.to_string(),
                "path": partition.path(),
                "level": level,
            }),
        );
        session.router.refresh_permissions().await?;
        let grants = session.router.permissions().map(|snapshot| snapshot.len());
        session.emit(
            EventKind::PermissionsRefreshed,
            serde_json::json!({ "grants": grants }),
        );

        let effective = match &subject {
            GrantSubject::Identity(target) => Some(session.router.access_level(target, &owner)?),
            GrantSubject::Wildcard => None,
        };
        Ok(GrantReport {
            subject: subject.to_string(),
            owner: owner.to_string(),
            partition: partition.path().to_string(),
            requested: level,
            effective,
        })
    })?;

    let output = session.output();
    let warnings = session.finish()?;

    let mut human = HumanOutput::new(if report.requested == AccessLevel::None {
        format!("Revoked access for {} on {}", report.subject, report.partition)
    } else {
        format!(
            "Granted {} access to {} on {}",
            report.requested, report.subject, report.partition
        )
    });
    if let Some(effective) = report.effective {
        human.push_summary("effective", effective.to_string());
    }
    for warning in warnings {
        human.push_warning(warning);
    }

    emit_success(output, "grant", &report, Some(&human))
}

pub fn run_grants(globals: GlobalOptions) -> Result<()> {
    let mut session = Session::open(&globals, None)?;
    block_on(session.start())?;

    let snapshot = session.router.permissions();
    let mut grants: Vec<GrantEntry> = snapshot
        .as_ref()
        .map(|snapshot| {
            snapshot
                .grants()
                .iter()
                .map(|grant| GrantEntry {
                    subject: grant.subject.to_string(),
                    path: grant.path.clone(),
                    level: grant.level,
                })
                .collect()
        })
        .unwrap_or_default();
    grants.sort_by(|left, right| {
        left.path
            .cmp(&right.path)
            .then_with(|| right.level.cmp(&left.level))
            .then_with(|| left.subject.cmp(&right.subject))
    });
    let report = GrantsReport {
        total: grants.len(),
        fetched_at: snapshot.as_ref().map(|snapshot| snapshot.fetched_at()),
        grants,
    };
    session.emit(
        EventKind::PermissionsRefreshed,
        serde_json::json!({ "grants": report.total }),
    );

    let output = session.output();
    let warnings = session.finish()?;

    let mut human = HumanOutput::new(format!("Grants: {}", report.total));
    for grant in &report.grants {
        human.push_detail(format!("{} {} {}", grant.path, grant.subject, grant.level));
    }
    for warning in warnings {
        human.push_warning(warning);
    }

    emit_success(output, "grants", &report, Some(&human))
}
