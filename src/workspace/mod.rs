//! Per-task isolated git worktrees.
//!
//! Every task gets its own worktree on branch `<prefix>/<task_id>`, created
//! from the base branch of the shared repository. A JSON registry record per
//! task makes the workspace reloadable across process restarts and carries the
//! preservation marker set when a task fails.

mod git;
mod manager;

pub use manager::WorkspaceManager;

use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_BRANCH_PREFIX: &str = "baton";

/// Explicit inputs for the workspace manager.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Root of the shared repository.
    pub repo_root: PathBuf,
    /// Parent directory for task worktrees.
    pub worktrees_dir: PathBuf,
    /// Directory holding `<task_id>.json` registry records.
    pub registry_dir: PathBuf,
    /// Branch to fork from and merge into. `None` uses the branch the shared
    /// tree currently has checked out.
    pub base_branch: Option<String>,
    pub branch_prefix: String,
}

/// An allocated task workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    /// Commit the branch was forked from.
    pub base_revision: String,
    pub created_at: DateTime<Utc>,
}

/// Registry record persisted under `registry_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    #[serde(flatten)]
    pub workspace: Workspace,
    #[serde(default)]
    pub preserved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserved_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserved_at: Option<DateTime<Utc>>,
}

impl WorkspaceRecord {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            preserved: false,
            preserved_reason: None,
            preserved_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    /// The `--no-ff` merge commit, `None` when the branch was already merged.
    pub merge_commit: Option<String>,
    pub already_merged: bool,
    pub base_branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStatus {
    Merged,
    Unmerged,
    BranchMissing,
}

/// Safety checks evaluated before a workspace is torn down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupCheck {
    pub worktree_exists: bool,
    pub has_uncommitted_changes: bool,
    pub branch_exists: bool,
    pub branch_merged: bool,
    pub merge_status: MergeStatus,
}

impl CleanupCheck {
    pub fn is_safe(&self) -> bool {
        !self.has_uncommitted_changes && (!self.branch_exists || self.branch_merged)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub worktree_removed: bool,
    pub branch_deleted: bool,
    pub forced: bool,
    pub check: CleanupCheck,
}

/// Files and lines changed between the base revision and the branch tip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileChangeSummary {
    pub files_added: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub total_lines_added: usize,
    pub total_lines_removed: usize,
}

impl FileChangeSummary {
    pub fn total_files(&self) -> usize {
        self.files_added.len() + self.files_modified.len() + self.files_deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_files() == 0
    }

    /// One-line summary, e.g. `3 file(s) changed, +40 -2`.
    pub fn headline(&self) -> String {
        format!(
            "{} file(s) changed, +{} -{}",
            self.total_files(),
            self.total_lines_added,
            self.total_lines_removed
        )
    }
}
