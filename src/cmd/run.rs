//! `baton run <TASK_ID>`: start or resume a task.

use anyhow::{Context, Result};
use std::path::Path;

use baton::config::Config;
use baton::orchestrator::{RunOutcome, TaskOrchestrator};
use baton::task::{Task, TaskId};

/// Returns the process exit status: 0 completed, 42 agent required, 1 failed.
pub async fn cmd_run(
    config: Config,
    task_id: &str,
    title: Option<&str>,
    description: Option<&str>,
    description_file: Option<&Path>,
) -> Result<u8> {
    let id = TaskId::new(task_id)?;
    let description = match (description, description_file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read description file {}", path.display()))?,
        (None, None) => String::new(),
    };
    let title = title.map(str::to_string).unwrap_or_else(|| id.to_string());
    let task = Task::new(id.clone(), title, description);

    let orchestrator = TaskOrchestrator::new(config);
    let outcome = orchestrator
        .run(task)
        .await
        .with_context(|| format!("Task {} could not run", id))?;

    match &outcome {
        RunOutcome::Completed => {
            println!("{} Task {} completed", console::style("✓").green().bold(), id);
        }
        RunOutcome::AwaitingAgent {
            phase,
            request_path,
        } => {
            println!(
                "{} Task {} waiting on agent for phase {}",
                console::style("…").yellow().bold(),
                id,
                phase
            );
            println!("  Request: {}", request_path.display());
            println!(
                "  {}",
                console::style(format!("Re-run 'baton run {}' once the response is written", id)).dim()
            );
        }
        RunOutcome::Failed { phase, reason } => {
            println!(
                "{} Task {} failed in phase {}: {}",
                console::style("✗").red().bold(),
                id,
                phase,
                reason
            );
            println!(
                "  {}",
                console::style(format!(
                    "Workspace kept for inspection. 'baton reset {} --force' discards it.",
                    id
                ))
                .dim()
            );
        }
    }

    Ok(u8::try_from(outcome.exit_code()).unwrap_or(1))
}
