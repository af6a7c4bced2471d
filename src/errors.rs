//! Typed error hierarchy for the baton orchestrator.
//!
//! One enum per component:
//! - `ValidationError`: task identifiers and phase markers
//! - `WorkspaceError`: worktree creation, merge, cleanup
//! - `CheckpointError`: checkpoint persistence
//! - `HandoffError`: agent request/response files
//! - `PhaseError`: failures raised while a single phase runs
//! - `OrchestratorError`: the phase driver, wrapping all of the above

use crate::task::{PhaseMarker, TaskStatus};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from constructing model values.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid task id '{id}': {reason}")]
    InvalidTaskId { id: String, reason: String },

    #[error("Invalid phase marker '{value}': {reason}")]
    InvalidPhaseMarker { value: String, reason: String },
}

/// Errors from the workspace manager. Never retried by the manager itself.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to create workspace for {task_id}: {reason}")]
    Creation { task_id: String, reason: String },

    #[error("No workspace registered for task {task_id}")]
    NotFound { task_id: String },

    #[error("Workspace for {task_id} has uncommitted changes at {path}")]
    UncommittedChanges { task_id: String, path: PathBuf },

    #[error(
        "Merge of {branch} into {base_branch} conflicts in {} file(s); workspace for {task_id} kept",
        .conflicts.len()
    )]
    MergeConflict {
        task_id: String,
        branch: String,
        base_branch: String,
        conflicts: Vec<PathBuf>,
    },

    #[error("Shared tree at {path} has uncommitted changes; refusing to merge")]
    SharedTreeDirty { path: PathBuf },

    #[error("Branch {branch} has commits not reachable from {base_branch}")]
    UnmergedBranch {
        task_id: String,
        branch: String,
        base_branch: String,
    },

    #[error("git {args} failed (exit {code}): {stderr}")]
    GitCommand {
        args: String,
        code: i32,
        stderr: String,
    },

    #[error("Failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Failed to access workspace registry at {path}: {source}")]
    Registry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workspace registry record at {path} is unreadable: {source}")]
    RegistryCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to acquire merge lock at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint found for task {task_id} at {path}: cannot resume")]
    NotFound { task_id: String, path: PathBuf },

    #[error("Checkpoint at {path} is malformed: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint at {path} is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl CheckpointError {
    /// True for both unparsable and structurally invalid checkpoint files.
    pub fn is_corrupt_state(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Invalid { .. })
    }
}

/// Errors from the agent handoff bridge.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("Agent response at {path} is structurally invalid: {reason}")]
    InvalidResponse { path: PathBuf, reason: String },

    #[error("Handoff file I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize agent request: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Errors raised inside a single phase.
///
/// Workspace errors are recorded as a task failure; everything else aborts
/// the run and leaves the checkpoint at the last good state.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Phase {phase} found malformed data: {reason}")]
    MalformedPhaseData { phase: String, reason: String },

    #[error("Task {task_id} has no workspace; required state is missing")]
    MissingWorkspace { task_id: String },

    #[error("Failed to encode results of phase {phase}: {source}")]
    Encode {
        phase: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

/// Errors from the phase driver.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Cannot resume at phase {marker}: {reason}")]
    NotResumable { marker: PhaseMarker, reason: String },

    #[error("Task {task_id} is {status}; reset it before running again")]
    TaskClosed { task_id: String, status: TaskStatus },

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),
}
