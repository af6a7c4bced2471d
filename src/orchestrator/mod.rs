//! Phase driver: runs a task through the phase table, checkpointing at every
//! boundary and suspending with exit status 42 whenever agent work is needed.

mod phases;
mod runner;

pub use runner::TaskOrchestrator;

use crate::handoff::AGENT_REQUIRED_EXIT_CODE;
use crate::phase::PhaseId;
use crate::task::TaskStatus;
use crate::workspace::CleanupResult;
use std::path::PathBuf;

/// How a single `run` invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every phase finished; the checkpoint has been deleted.
    Completed,
    /// A request file is waiting for the external agent.
    AwaitingAgent { phase: PhaseId, request_path: PathBuf },
    /// The task failed and its workspace was kept for inspection.
    Failed { phase: PhaseId, reason: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::AwaitingAgent { .. } => AGENT_REQUIRED_EXIT_CODE,
            RunOutcome::Failed { .. } => 1,
        }
    }
}

/// What `reset` removed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetReport {
    pub checkpoint_removed: bool,
    pub workspace: Option<CleanupResult>,
}

/// Status recorded by `cancel`, plus whether a workspace was preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelReport {
    pub status: TaskStatus,
    pub workspace_preserved: bool,
}
