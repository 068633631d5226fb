//! shared-tasks task command implementations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::cli::session::{block_on, Session};
use crate::cli::GlobalOptions;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::output::{emit_success, HumanOutput};
use crate::task::{Task, TaskDraft, TaskPatch};

pub struct ListOptions {
    pub owner: Option<String>,
    pub globals: GlobalOptions,
}

pub struct NewOptions {
    pub title: String,
    pub details: Option<String>,
    pub due: Option<String>,
    pub owner: Option<String>,
    pub globals: GlobalOptions,
}

pub struct EditOptions {
    pub id: String,
    pub title: Option<String>,
    pub details: Option<String>,
    pub due: Option<String>,
    pub clear_due: bool,
    pub owner: Option<String>,
    pub globals: GlobalOptions,
}

pub struct SeedOptions {
    pub count: usize,
    pub owner: Option<String>,
    pub globals: GlobalOptions,
}

pub struct RmOptions {
    pub id: String,
    pub owner: Option<String>,
    pub globals: GlobalOptions,
}

#[derive(Serialize)]
struct TaskListReport {
    owner: String,
    title: Option<String>,
    access: String,
    total: usize,
    tasks: Vec<Task>,
}

#[derive(Serialize)]
struct SeedReport {
    owner: String,
    created: usize,
    total: usize,
}

#[derive(Serialize)]
struct TaskDeletedReport {
    id: Uuid,
    owner: String,
}

pub fn run_list(options: ListOptions) -> Result<()> {
    let mut session = Session::open(&options.globals, None)?;
    let owner = block_on(async {
        session.start().await?;
        session.select_owner(options.owner.as_deref()).await
    })?;

    let mut tasks = session.router.tasks().as_ref().clone();
    tasks.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.id.cmp(&right.id))
    });
    let report = TaskListReport {
        owner: owner.to_string(),
        title: session.router.partition_title(),
        access: session.router.my_access().to_string(),
        total: tasks.len(),
        tasks,
    };

    let output = session.output();
    let warnings = session.finish()?;

    let now = Utc::now();
    let header = report
        .title
        .clone()
        .unwrap_or_else(|| format!("{}'s Tasks", report.owner));
    let mut human = HumanOutput::new(header);
    human.push_summary("tasks", report.total.to_string());
    for task in &report.tasks {
        let mut line = format!("{} {}", short_id(task.id), task.title);
        if let Some(due) = task.due_at {
            let marker = if task.is_overdue(now) { "overdue" } else { "due" };
            line.push_str(&format!(" ({marker} {})", due.format("%Y-%m-%d %H:%M")));
        }
        human.push_detail(line);
    }
    for warning in warnings {
        human.push_warning(warning);
    }
    if report.tasks.is_empty() {
        human.push_next_step("shared-tasks task new <title>");
    }

    emit_success(output, "tasks", &report, Some(&human))
}

pub fn run_new(options: NewOptions) -> Result<()> {
    let mut draft = TaskDraft::new(options.title.trim());
    if let Some(details) = options.details {
        draft = draft.with_details(details);
    }
    if let Some(due) = parse_timestamp("due", options.due.as_deref())? {
        draft = draft.with_due(due);
    }
    draft.validate()?;

    let mut session = Session::open(&options.globals, None)?;
    let task = block_on(async {
        session.start().await?;
        session.select_owner(options.owner.as_deref()).await?;
        let task = session.router.create_task(draft).await?;
        session.emit(EventKind::TaskCreated, &task);
        Ok(task)
    })?;

    let output = session.output();
    let warnings = session.finish()?;

    let mut human = HumanOutput::new("Task created");
    human.push_summary("ID", task.id.to_string());
    human.push_summary("Title", task.title.clone());
    human.push_summary("Owner", task.created_by.to_string());
    for warning in warnings {
        human.push_warning(warning);
    }

    emit_success(output, "task new", &task, Some(&human))
}

/// Fill a partition with numbered sample tasks. Needs admin access to it.
pub fn run_seed(options: SeedOptions) -> Result<()> {
    if options.count == 0 {
        return Err(Error::InvalidArgument("count must be at least 1".to_string()));
    }

    let mut session = Session::open(&options.globals, None)?;
    let (owner, total) = block_on(async {
        session.start().await?;
        let owner = session.select_owner(options.owner.as_deref()).await?;
        let level = session.router.my_access();
        if !level.may_manage() {
            return Err(Error::InsufficientAccess {
                subject: session.identity().to_string(),
                partition: session
                    .router
                    .selected()
                    .map(|partition| partition.path().to_string())
                    .unwrap_or_default(),
                level,
            });
        }

        let start = session.router.tasks().len();
        for n in 1..=options.count {
            let draft = TaskDraft::new(format!("Sample task {}", start + n));
            let task = session.router.create_task(draft).await?;
            session.emit(EventKind::TaskCreated, &task);
        }
        tracing::info!(owner = %owner, count = options.count, "seeded tasks");
        session.router.dispatch_pending()?;
        Ok((owner, session.router.tasks().len()))
    })?;

    let report = SeedReport {
        owner: owner.to_string(),
        created: options.count,
        total,
    };
    let output = session.output();
    let warnings = session.finish()?;

    let mut human = HumanOutput::new(format!("Added {} sample tasks", report.created));
    human.push_summary("owner", report.owner.clone());
    human.push_summary("tasks", report.total.to_string());
    for warning in warnings {
        human.push_warning(warning);
    }

    emit_success(output, "task seed", &report, Some(&human))
}

pub fn run_edit(options: EditOptions) -> Result<()> {
    let mut patch = TaskPatch::default();
    if let Some(title) = options.title {
        patch = patch.with_title(title.trim());
    }
    if let Some(details) = options.details {
        patch = patch.with_details(details);
    }
    if options.clear_due {
        patch.due_at = Some(None);
    } else if let Some(due) = parse_timestamp("due", options.due.as_deref())? {
        patch.due_at = Some(Some(due));
    }
    patch.validate()?;

    let mut session = Session::open(&options.globals, None)?;
    let task = block_on(async {
        session.start().await?;
        session.select_owner(options.owner.as_deref()).await?;
        let id = resolve_task_id(&session.router.tasks(), &options.id)?;
        let task = session.router.mutate_task(id, patch).await?;
        session.emit(EventKind::TaskEdited, &task);
        Ok(task)
    })?;

    let output = session.output();
    let warnings = session.finish()?;

    let mut human = HumanOutput::new("Task updated");
    human.push_summary("ID", task.id.to_string());
    human.push_summary("Title", task.title.clone());
    human.push_summary("Updated by", task.last_updated_by.to_string());
    for warning in warnings {
        human.push_warning(warning);
    }

    emit_success(output, "task edit", &task, Some(&human))
}

pub fn run_rm(options: RmOptions) -> Result<()> {
    let mut session = Session::open(&options.globals, None)?;
    let report = block_on(async {
        session.start().await?;
        let owner = session.select_owner(options.owner.as_deref()).await?;
        let id = resolve_task_id(&session.router.tasks(), &options.id)?;
        session.router.delete_task(id).await?;
        let report = TaskDeletedReport {
            id,
            owner: owner.to_string(),
        };
        session.emit(EventKind::TaskDeleted, &report);
        Ok(report)
    })?;

    let output = session.output();
    let warnings = session.finish()?;

    let mut human = HumanOutput::new("Task deleted");
    human.push_summary("ID", report.id.to_string());
    human.push_summary("Owner", report.owner.clone());
    for warning in warnings {
        human.push_warning(warning);
    }

    emit_success(output, "task rm", &report, Some(&human))
}

/// Full id, or a prefix matching exactly one task.
fn resolve_task_id(tasks: &[Task], raw: &str) -> Result<Uuid> {
    let raw = raw.trim();
    if let Ok(id) = Uuid::parse_str(raw) {
        return Ok(id);
    }
    if raw.is_empty() {
        return Err(Error::InvalidArgument("task id cannot be empty".to_string()));
    }

    let needle = raw.to_ascii_lowercase();
    let matches: Vec<Uuid> = tasks
        .iter()
        .map(|task| task.id)
        .filter(|id| id.to_string().starts_with(&needle))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(Error::TaskNotFound(raw.to_string())),
        _ => Err(Error::InvalidArgument(format!(
            "task id prefix '{raw}' matches {} tasks",
            matches.len()
        ))),
    }
}

fn short_id(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn parse_timestamp(label: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = DateTime::parse_from_rfc3339(value).map_err(|err| {
        Error::InvalidArgument(format!("invalid {label} timestamp '{value}': {err}"))
    })?;
    Ok(Some(parsed.with_timezone(&Utc)))
}
