//! Checkpoint status, cancel and reset commands.

use anyhow::{Context, Result};
use console::{StyledObject, style};

use baton::checkpoint::Checkpoint;
use baton::config::Config;
use baton::orchestrator::TaskOrchestrator;
use baton::phase::PhaseId;
use baton::task::{TaskId, TaskStatus};

fn styled_status(status: TaskStatus) -> StyledObject<String> {
    let text = status.to_string();
    match status {
        TaskStatus::Completed => style(text).green(),
        TaskStatus::Active | TaskStatus::Pending => style(text).cyan(),
        TaskStatus::AwaitingAgent => style(text).yellow(),
        TaskStatus::Failed | TaskStatus::PreservedForInspection => style(text).red(),
    }
}

fn phase_name(checkpoint: &Checkpoint) -> String {
    PhaseId::from_marker(checkpoint.phase)
        .map(|p| p.to_string())
        .unwrap_or_else(|| format!("{} (unknown)", checkpoint.phase))
}

pub fn cmd_status(config: &Config, task_id: Option<&str>) -> Result<()> {
    let store = config.checkpoint_store();

    if let Some(raw) = task_id {
        let id = TaskId::new(raw)?;
        if !store.exists(&id) {
            println!("No checkpoint for task {}", id);
            return Ok(());
        }
        let checkpoint = store.load(&id)?;
        print_detail(&id, &checkpoint);
        return Ok(());
    }

    let ids = store.list().context("Failed to list checkpoints")?;
    if ids.is_empty() {
        println!("No tasks with checkpoints.");
        return Ok(());
    }

    println!();
    println!("{:<24} {:<26} {:<22} Checkpoint", "Task", "Status", "Phase");
    println!(
        "{:<24} {:<26} {:<22} ----------",
        "----", "------", "-----"
    );
    for id in ids {
        match store.load(&id) {
            Ok(checkpoint) => println!(
                "{:<24} {:<26} {:<22} {}",
                id.as_str(),
                styled_status(checkpoint.status),
                phase_name(&checkpoint),
                checkpoint.checkpoint
            ),
            Err(e) => println!(
                "{:<24} {}",
                id.as_str(),
                style(format!("unreadable: {}", e)).red()
            ),
        }
    }
    println!();
    Ok(())
}

fn print_detail(id: &TaskId, checkpoint: &Checkpoint) {
    println!();
    println!("Task:       {}", id);
    if let Some(title) = checkpoint
        .config
        .get("task")
        .and_then(|t| t.get("title"))
        .and_then(|t| t.as_str())
    {
        println!("Title:      {}", title);
    }
    println!("Status:     {}", styled_status(checkpoint.status));
    println!("Phase:      {}", phase_name(checkpoint));
    println!("Checkpoint: {}", checkpoint.checkpoint);
    println!("Created:    {}", checkpoint.created_at.to_rfc3339());
    println!("Updated:    {}", checkpoint.updated_at.to_rfc3339());

    let completed: Vec<&str> = PhaseId::ALL
        .iter()
        .map(|p| p.label())
        .filter(|label| checkpoint.phase_data.contains_key(*label))
        .collect();
    if !completed.is_empty() {
        println!("Completed:  {}", completed.join(", "));
    }

    if let Some(pending) = &checkpoint.agent_request_pending {
        println!(
            "Pending:    agent request {} for phase {} (since {})",
            pending.request_id,
            pending.phase,
            pending.requested_at.to_rfc3339()
        );
    }
    if let Some(reason) = checkpoint
        .phase_data
        .get("failure")
        .and_then(|f| f.get("reason"))
        .and_then(|r| r.as_str())
    {
        println!("Failure:    {}", style(reason).red());
    }
    println!();
}

pub fn cmd_cancel(config: Config, task_id: &str, reason: &str) -> Result<()> {
    let id = TaskId::new(task_id)?;
    let report = TaskOrchestrator::new(config)
        .cancel(&id, reason)
        .with_context(|| format!("Failed to cancel task {}", id))?;

    println!(
        "{} Task {} marked {}",
        style("✗").red().bold(),
        id,
        styled_status(report.status)
    );
    if report.workspace_preserved {
        println!("  Workspace kept for inspection.");
    }
    Ok(())
}

pub async fn cmd_reset(config: Config, task_id: &str, force: bool) -> Result<()> {
    let id = TaskId::new(task_id)?;
    let report = TaskOrchestrator::new(config)
        .reset(&id, force)
        .await
        .with_context(|| format!("Failed to reset task {}", id))?;

    if report.checkpoint_removed {
        println!("Removed checkpoint for task {}", id);
    } else {
        println!("No checkpoint for task {}", id);
    }
    if let Some(cleanup) = report.workspace {
        println!(
            "Removed workspace (worktree: {}, branch: {})",
            if cleanup.worktree_removed { "yes" } else { "no" },
            if cleanup.branch_deleted { "yes" } else { "no" }
        );
    }
    Ok(())
}
