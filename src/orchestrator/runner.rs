use super::{CancelReport, ResetReport, RunOutcome};
use crate::checkpoint::{CheckpointDraft, CheckpointStore};
use crate::config::Config;
use crate::errors::{CheckpointError, OrchestratorError, PhaseError, WorkspaceError};
use crate::gates::{QualityGate, ResiliencePolicy};
use crate::handoff::{AgentBridge, HandoffPoll, WaitReason};
use crate::phase::{PhaseFailure, PhaseId, PhaseOutcome};
use crate::task::{PhaseMarker, Task, TaskId, TaskStatus};
use crate::workspace::{Workspace, WorkspaceManager};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

/// `config` key holding the admitted task.
pub(super) const TASK_KEY: &str = "task";
/// `phase_data` key holding the failure record.
pub(super) const FAILURE_KEY: &str = "failure";

/// State carried from phase to phase within one invocation.
pub(super) struct RunState {
    pub task: Task,
    pub draft: CheckpointDraft,
    pub workspace: Option<Workspace>,
}

pub(super) enum Step {
    Outcome(PhaseOutcome),
    /// A request is outstanding and its response has not arrived.
    Waiting(WaitReason),
}

/// Drives tasks through the phase table.
pub struct TaskOrchestrator {
    pub(super) config: Config,
    pub(super) workspaces: WorkspaceManager,
    pub(super) checkpoints: CheckpointStore,
    pub(super) gate: Option<Arc<dyn QualityGate>>,
    pub(super) policy: ResiliencePolicy,
}

impl TaskOrchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            workspaces: config.workspace_manager(),
            checkpoints: config.checkpoint_store(),
            policy: config.resilience_policy(),
            gate: None,
            config,
        }
    }

    /// Run quality gates through `gate` instead of the configured commands.
    pub fn with_quality_gate(mut self, gate: Arc<dyn QualityGate>, policy: ResiliencePolicy) -> Self {
        self.gate = Some(gate);
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Start `task`, or resume it from its checkpoint.
    ///
    /// On resume the task recorded in the checkpoint takes precedence over
    /// the one passed in.
    pub async fn run(&self, task: Task) -> Result<RunOutcome, OrchestratorError> {
        let bridge = self.config.agent_bridge(&task.id);

        if !self.checkpoints.exists(&task.id) {
            info!(task_id = %task.id, title = %task.title, "Starting task");
            let first = PhaseId::first();
            let mut draft = CheckpointDraft::new("task_started", first.marker());
            draft
                .config
                .insert(TASK_KEY.to_string(), encode(first, &task)?);
            let mut state = RunState {
                task,
                draft,
                workspace: None,
            };
            return self.drive(first, &mut state, &bridge).await;
        }

        let checkpoint = self.checkpoints.load(&task.id)?;
        if checkpoint.status.is_closed() {
            return Err(OrchestratorError::TaskClosed {
                task_id: task.id.to_string(),
                status: checkpoint.status,
            });
        }
        let phase = resume_handler(checkpoint.phase)?;
        let draft = checkpoint.to_draft();
        let task = stored_task(&draft, task)?;
        let workspace = match self.workspaces.open(&task.id) {
            Ok(workspace) => Some(workspace),
            Err(WorkspaceError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        info!(
            task_id = %task.id,
            phase = %phase,
            checkpoint = %draft.label,
            "Resuming task"
        );
        let mut state = RunState {
            task,
            draft,
            workspace,
        };
        self.drive(phase, &mut state, &bridge).await
    }

    async fn drive(
        &self,
        start: PhaseId,
        state: &mut RunState,
        bridge: &AgentBridge,
    ) -> Result<RunOutcome, OrchestratorError> {
        let task_id = state.task.id.clone();
        let mut phase = start;

        loop {
            info!(task_id = %task_id, phase = %phase, "Running phase");
            let step = match self.execute(phase, state, bridge).await {
                Ok(step) => step,
                Err(PhaseError::Workspace(e)) => {
                    Step::Outcome(PhaseOutcome::Fail(workspace_failure(phase, &e)))
                }
                Err(e) => return Err(e.into()),
            };

            let outcome = match step {
                Step::Outcome(outcome) => outcome,
                Step::Waiting(reason) => {
                    info!(task_id = %task_id, phase = %phase, %reason, "Still waiting on agent");
                    return Ok(RunOutcome::AwaitingAgent {
                        phase,
                        request_path: bridge.request_path(phase.marker()),
                    });
                }
            };

            match outcome {
                PhaseOutcome::Advance(results) => {
                    state
                        .draft
                        .phase_data
                        .insert(phase.label().to_string(), results);
                    let answered = state.draft.pending.take().is_some();
                    state.draft.status = TaskStatus::Active;

                    let Some(next) = phase.next() else {
                        return self.complete(&task_id, bridge);
                    };
                    state.draft.label = phase.complete_label();
                    state.draft.phase = next.marker();
                    self.checkpoints.save(&task_id, &state.draft)?;
                    if answered {
                        bridge.consume(phase.marker())?;
                    }
                    info!(task_id = %task_id, completed = %phase, next = %next, "Phase complete");
                    phase = next;
                }
                PhaseOutcome::RequestAgent(payload) => {
                    let pending =
                        bridge.request(&task_id, phase.marker(), phase.label(), payload)?;
                    state.draft.label = format!("{}_awaiting_agent", phase.label());
                    state.draft.phase = phase.marker();
                    state.draft.status = TaskStatus::AwaitingAgent;
                    state.draft.pending = Some(pending);
                    self.checkpoints.save(&task_id, &state.draft)?;

                    info!(task_id = %task_id, phase = %phase, "Suspending for agent work");
                    return Ok(RunOutcome::AwaitingAgent {
                        phase,
                        request_path: bridge.request_path(phase.marker()),
                    });
                }
                PhaseOutcome::Fail(failure) => return self.fail(phase, failure, state),
            }
        }
    }

    async fn execute(
        &self,
        phase: PhaseId,
        state: &mut RunState,
        bridge: &AgentBridge,
    ) -> Result<Step, PhaseError> {
        let outcome = match phase {
            PhaseId::WorkspaceSetup => self.workspace_setup(state).await?,
            PhaseId::Planning | PhaseId::Implementation | PhaseId::CodeReview => {
                return self.agent_phase(phase, state, bridge);
            }
            PhaseId::CommitChanges => self.commit_changes(state)?,
            PhaseId::QualityGates => self.quality_gates(state).await?,
            PhaseId::ChangeSummary => self.change_summary(state)?,
            PhaseId::Integration => self.integration(state).await?,
        };
        Ok(Step::Outcome(outcome))
    }

    /// Request agent work, or pick up the answer to an earlier request.
    fn agent_phase(
        &self,
        phase: PhaseId,
        state: &RunState,
        bridge: &AgentBridge,
    ) -> Result<Step, PhaseError> {
        let Some(pending) = &state.draft.pending else {
            let payload = self.agent_payload(phase, state)?;
            return Ok(Step::Outcome(PhaseOutcome::RequestAgent(payload)));
        };

        match bridge.poll(pending)? {
            HandoffPoll::Waiting(reason) => Ok(Step::Waiting(reason)),
            HandoffPoll::Fulfilled(response) => self
                .accept_response(phase, &response, bridge)
                .map(Step::Outcome),
        }
    }

    fn complete(&self, task_id: &TaskId, bridge: &AgentBridge) -> Result<RunOutcome, OrchestratorError> {
        self.checkpoints.cleanup(task_id)?;
        bridge.clear()?;
        info!(task_id = %task_id, "Task completed");
        Ok(RunOutcome::Completed)
    }

    fn fail(
        &self,
        phase: PhaseId,
        failure: PhaseFailure,
        state: &mut RunState,
    ) -> Result<RunOutcome, OrchestratorError> {
        let task_id = state.task.id.clone();
        warn!(task_id = %task_id, phase = %phase, reason = %failure.reason, "Phase failed");

        state.draft.status = match &state.workspace {
            Some(workspace) => match self.workspaces.preserve_on_failure(workspace, &failure.reason) {
                Ok(_) => TaskStatus::PreservedForInspection,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Could not mark workspace as preserved");
                    TaskStatus::Failed
                }
            },
            None => TaskStatus::Failed,
        };
        state
            .draft
            .phase_data
            .insert(FAILURE_KEY.to_string(), encode(phase, &failure)?);
        state.draft.label = format!("{}_failed", phase.label());
        state.draft.phase = phase.marker();
        state.draft.pending = None;
        self.checkpoints.save(&task_id, &state.draft)?;

        Ok(RunOutcome::Failed {
            phase,
            reason: failure.reason,
        })
    }

    /// Mark a task failed between phases and keep its workspace.
    pub fn cancel(&self, task_id: &TaskId, reason: &str) -> Result<CancelReport, OrchestratorError> {
        let checkpoint = self.checkpoints.load(task_id)?;
        if checkpoint.status.is_closed() {
            return Err(OrchestratorError::TaskClosed {
                task_id: task_id.to_string(),
                status: checkpoint.status,
            });
        }

        let mut draft = checkpoint.to_draft();
        let failure = PhaseFailure {
            phase: PhaseId::from_marker(draft.phase)
                .map(|p| p.label().to_string())
                .unwrap_or_else(|| draft.phase.to_string()),
            reason: format!("cancelled: {}", reason),
            details: Value::Null,
        };

        let workspace_preserved = match self.workspaces.open(task_id) {
            Ok(workspace) => {
                self.workspaces
                    .preserve_on_failure(&workspace, &failure.reason)?;
                true
            }
            Err(WorkspaceError::NotFound { .. }) => false,
            Err(e) => return Err(e.into()),
        };

        draft.phase_data.insert(
            FAILURE_KEY.to_string(),
            serde_json::to_value(&failure).map_err(CheckpointError::Serialize)?,
        );
        draft.status = TaskStatus::Failed;
        draft.label = "cancelled".to_string();
        draft.pending = None;
        self.config.agent_bridge(task_id).clear()?;
        self.checkpoints.save(task_id, &draft)?;

        warn!(task_id = %task_id, reason, "Task cancelled");
        Ok(CancelReport {
            status: TaskStatus::Failed,
            workspace_preserved,
        })
    }

    /// Forget a task's checkpoint and handoff files. With `force`, also
    /// remove its workspace and branch regardless of their state.
    pub async fn reset(&self, task_id: &TaskId, force: bool) -> Result<ResetReport, OrchestratorError> {
        let workspace = if force {
            match self.workspaces.open(task_id) {
                Ok(workspace) => Some(self.workspaces.cleanup(&workspace, true).await?),
                Err(WorkspaceError::NotFound { .. }) => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        let checkpoint_removed = self.checkpoints.exists(task_id);
        self.checkpoints.cleanup(task_id)?;
        self.config.agent_bridge(task_id).clear()?;

        info!(task_id = %task_id, checkpoint_removed, force, "Task reset");
        Ok(ResetReport {
            checkpoint_removed,
            workspace,
        })
    }
}

/// Map a checkpoint marker to the phase that resumes it.
fn resume_handler(marker: PhaseMarker) -> Result<PhaseId, OrchestratorError> {
    match PhaseId::from_marker(marker) {
        Some(phase) if phase.is_resumable() => Ok(phase),
        Some(phase) => Err(OrchestratorError::NotResumable {
            marker,
            reason: format!("{} only runs when a task starts", phase.label()),
        }),
        None => Err(OrchestratorError::NotResumable {
            marker,
            reason: "no phase has this marker".to_string(),
        }),
    }
}

fn stored_task(draft: &CheckpointDraft, fallback: Task) -> Result<Task, PhaseError> {
    match draft.config.get(TASK_KEY) {
        Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| PhaseError::MalformedPhaseData {
            phase: TASK_KEY.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(fallback),
    }
}

fn workspace_failure(phase: PhaseId, err: &WorkspaceError) -> PhaseFailure {
    let details = match err {
        WorkspaceError::MergeConflict {
            branch,
            base_branch,
            conflicts,
            ..
        } => json!({ "branch": branch, "base_branch": base_branch, "conflicts": conflicts }),
        WorkspaceError::UncommittedChanges { path, .. } => json!({ "path": path }),
        _ => Value::Null,
    };
    PhaseFailure::new(phase, err.to_string()).with_details(details)
}

pub(super) fn encode<T: Serialize>(phase: PhaseId, value: &T) -> Result<Value, PhaseError> {
    serde_json::to_value(value).map_err(|source| PhaseError::Encode {
        phase: phase.label().to_string(),
        source,
    })
}
