//! Command-line interface for shared-tasks
//!
//! This module defines the CLI structure using clap derive macros.
//! Each group of subcommands is defined in its own submodule.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::Result;

mod access;
mod login;
mod profile;
mod session;
mod task;

/// shared-tasks - access-scoped task lists
///
/// Every user owns a private task list and can let others read, write or
/// administer it. Commands act as the signed-in identity against the store
/// directory.
#[derive(Parser, Debug)]
#[command(name = "shared-tasks")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Store directory (defaults to the platform data directory)
    #[arg(long, global = true, env = "SHARED_TASKS_HOME")]
    pub store: Option<PathBuf>,

    /// Identity to act as
    #[arg(long, global = true, env = "SHARED_TASKS_IDENTITY")]
    pub identity: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit JSONL events to a file, or "-" for stdout
    #[arg(long, global = true)]
    pub events: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Remember an identity for later commands and create its profile
    Login {
        identity: String,

        /// First name for a new profile
        #[arg(long)]
        first: Option<String>,

        /// Last name for a new profile
        #[arg(long)]
        last: Option<String>,
    },

    /// Forget the remembered identity
    Logout,

    /// Show the identity commands act as
    Whoami,

    /// Own profile
    #[command(subcommand)]
    Profile(ProfileCommands),

    /// List everyone in the directory
    People {
        /// Only people seen within the presence window
        #[arg(long)]
        online: bool,
    },

    /// List tasks in a partition
    Tasks {
        /// Whose tasks to show (defaults to your own)
        #[arg(long)]
        owner: Option<String>,
    },

    /// Task management
    #[command(subcommand)]
    Task(TaskCommands),

    /// Show an access level on a partition
    Access {
        /// Partition owner (defaults to you)
        #[arg(long)]
        owner: Option<String>,

        /// Whose level to show (defaults to you)
        #[arg(long)]
        subject: Option<String>,
    },

    /// Grant a level on a partition to an identity or "*"
    Grant {
        subject: String,

        /// none, read, write or admin
        level: String,

        /// Partition owner (defaults to you)
        #[arg(long)]
        owner: Option<String>,
    },

    /// List the grants visible to you
    Grants,
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommands {
    /// Show your profile
    Show,

    /// Set your display name
    SetName { first: String, last: String },

    /// Set or clear your avatar image
    SetAvatar {
        /// PNG file to use
        #[arg(required_unless_present = "clear")]
        path: Option<PathBuf>,

        /// Remove the current avatar
        #[arg(long, conflicts_with = "path")]
        clear: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Create a task
    New {
        title: String,

        /// Longer description
        #[arg(long)]
        details: Option<String>,

        /// Due date (RFC3339)
        #[arg(long)]
        due: Option<String>,

        /// Partition owner (defaults to you)
        #[arg(long)]
        owner: Option<String>,
    },

    /// Edit a task
    Edit {
        /// Task id or unique prefix
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        details: Option<String>,

        /// Due date (RFC3339)
        #[arg(long, conflicts_with = "clear_due")]
        due: Option<String>,

        /// Remove the due date
        #[arg(long)]
        clear_due: bool,

        #[arg(long)]
        owner: Option<String>,
    },

    /// Add numbered sample tasks (admin only)
    Seed {
        #[arg(long, default_value_t = 100)]
        count: usize,

        #[arg(long)]
        owner: Option<String>,
    },

    /// Delete a task
    Rm {
        /// Task id or unique prefix
        id: String,

        #[arg(long)]
        owner: Option<String>,
    },
}

/// Flags shared by every command.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub store: Option<PathBuf>,
    pub identity: Option<String>,
    pub json: bool,
    pub quiet: bool,
    pub events: Option<String>,
}

impl Cli {
    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        let globals = GlobalOptions {
            store: self.store,
            identity: self.identity,
            json: self.json,
            quiet: self.quiet,
            events: self.events,
        };

        match self.command {
            Commands::Login {
                identity,
                first,
                last,
            } => login::run_login(login::LoginOptions {
                identity,
                first,
                last,
                globals,
            }),
            Commands::Logout => login::run_logout(globals),
            Commands::Whoami => login::run_whoami(globals),
            Commands::Profile(cmd) => match cmd {
                ProfileCommands::Show => profile::run_show(globals),
                ProfileCommands::SetName { first, last } => {
                    profile::run_set_name(profile::SetNameOptions {
                        first,
                        last,
                        globals,
                    })
                }
                ProfileCommands::SetAvatar { path, clear } => {
                    profile::run_set_avatar(profile::SetAvatarOptions {
                        path: if clear { None } else { path },
                        globals,
                    })
                }
            },
            Commands::People { online } => {
                profile::run_people(profile::PeopleOptions { online, globals })
            }
            Commands::Tasks { owner } => task::run_list(task::ListOptions { owner, globals }),
            Commands::Task(cmd) => match cmd {
                TaskCommands::New {
                    title,
                    details,
                    due,
                    owner,
                } => task::run_new(task::NewOptions {
                    title,
                    details,
                    due,
                    owner,
                    globals,
                }),
                TaskCommands::Edit {
                    id,
                    title,
                    details,
                    due,
                    clear_due,
                    owner,
                } => task::run_edit(task::EditOptions {
                    id,
                    title,
                    details,
                    due,
                    clear_due,
                    owner,
                    globals,
                }),
                TaskCommands::Seed { count, owner } => task::run_seed(task::SeedOptions {
                    count,
                    owner,
                    globals,
                }),
                TaskCommands::Rm { id, owner } => {
                    task::run_rm(task::RmOptions { id, owner, globals })
                }
            },
            Commands::Access { owner, subject } => access::run_access(access::AccessOptions {
                owner,
                subject,
                globals,
            }),
            Commands::Grant {
                subject,
                level,
                owner,
            } => access::run_grant(access::GrantOptions {
                subject,
                level,
                owner,
                globals,
            }),
            Commands::Grants => access::run_grants(globals),
        }
    }
}
