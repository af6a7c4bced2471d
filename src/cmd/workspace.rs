//! `baton workspace list|cleanup`.

use anyhow::{Context, Result};
use console::style;

use baton::config::Config;
use baton::task::TaskId;

pub fn cmd_workspace_list(config: &Config) -> Result<()> {
    let records = config
        .workspace_manager()
        .list()
        .context("Failed to list workspaces")?;

    if records.is_empty() {
        println!("No workspaces.");
        return Ok(());
    }

    println!();
    println!("{:<24} {:<32} {:<12} State", "Task", "Branch", "Base");
    println!("{:<24} {:<32} {:<12} -----", "----", "------", "----");
    for record in records {
        let ws = &record.workspace;
        let state = if record.preserved {
            style(format!(
                "preserved: {}",
                record.preserved_reason.as_deref().unwrap_or("no reason recorded")
            ))
            .yellow()
        } else {
            style("active".to_string()).green()
        };
        println!(
            "{:<24} {:<32} {:<12} {}",
            ws.task_id.as_str(),
            ws.branch,
            ws.base_branch,
            state
        );
        println!("  {}", style(ws.path.display()).dim());
    }
    println!();
    Ok(())
}

pub async fn cmd_workspace_cleanup(config: &Config, task_id: &str, force: bool) -> Result<()> {
    let id = TaskId::new(task_id)?;
    let manager = config.workspace_manager();
    let workspace = manager.open(&id)?;
    let result = manager
        .cleanup(&workspace, force)
        .await
        .with_context(|| format!("Failed to clean up workspace for {}", id))?;

    println!(
        "{} Cleaned up workspace for {}{}",
        style("✓").green().bold(),
        id,
        if result.forced { " (forced)" } else { "" }
    );
    if result.branch_deleted {
        println!("  Deleted branch {}", workspace.branch);
    }
    Ok(())
}
