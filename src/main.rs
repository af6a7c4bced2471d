use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use baton::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "baton")]
#[command(version, about = "Resumable task orchestrator with agent handoff")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Branch tasks fork from and merge into. Overrides baton.toml and BATON_BASE_BRANCH.
    #[arg(long, global = true)]
    pub base_branch: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start or resume a task. Exits with status 42 when agent work is required.
    Run {
        task_id: String,

        /// Task title (defaults to the task id)
        #[arg(long)]
        title: Option<String>,

        #[arg(long, conflicts_with = "description_file")]
        description: Option<String>,

        /// Read the task description from a file
        #[arg(long)]
        description_file: Option<PathBuf>,
    },
    /// Show checkpoint status for one task, or all tasks
    Status { task_id: Option<String> },
    /// Mark a task failed and keep its workspace for inspection
    Cancel {
        task_id: String,

        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Delete a task's checkpoint and handoff files
    Reset {
        task_id: String,

        /// Also remove the workspace and its branch, even if unmerged
        #[arg(long)]
        force: bool,
    },
    /// Inspect or clean up task workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
}

impl Commands {
    /// Commands that change state get the file log as well.
    fn writes_state(&self) -> bool {
        match self {
            Commands::Status { .. } => false,
            Commands::Workspace { command } => matches!(command, WorkspaceCommands::Cleanup { .. }),
            _ => true,
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum WorkspaceCommands {
    /// List registered workspaces
    List,
    /// Remove a task's worktree and branch
    Cleanup {
        task_id: String,

        /// Remove even with uncommitted changes or unmerged commits
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<ExitCode> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(project_dir, cli.verbose, cli.base_branch.clone())?;

    for problem in config.settings.validate() {
        eprintln!("{} {}", console::style("warning:").yellow(), problem);
    }

    let _log_guard = if cli.command.writes_state() {
        config.ensure_directories()?;
        Some(baton::telemetry::init(&config.log_dir, cli.verbose)?)
    } else {
        None
    };

    match &cli.command {
        Commands::Run {
            task_id,
            title,
            description,
            description_file,
        } => {
            let code = cmd::cmd_run(
                config,
                task_id,
                title.as_deref(),
                description.as_deref(),
                description_file.as_deref(),
            )
            .await?;
            return Ok(ExitCode::from(code));
        }
        Commands::Status { task_id } => cmd::cmd_status(&config, task_id.as_deref())?,
        Commands::Cancel { task_id, reason } => cmd::cmd_cancel(config, task_id, reason)?,
        Commands::Reset { task_id, force } => cmd::cmd_reset(config, task_id, *force).await?,
        Commands::Workspace { command } => match command {
            WorkspaceCommands::List => cmd::cmd_workspace_list(&config)?,
            WorkspaceCommands::Cleanup { task_id, force } => {
                cmd::cmd_workspace_cleanup(&config, task_id, *force).await?
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}
