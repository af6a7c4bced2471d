use super::runner::{RunState, TaskOrchestrator, encode};
use crate::errors::PhaseError;
use crate::gates::{QualityGate, format_guidance, run_with_resilience};
use crate::handoff::{AgentBridge, AgentPayload, AgentResponse};
use crate::phase::{
    ImplementationResult, PhaseFailure, PhaseId, PhaseOutcome, PlanResult, ReviewResult,
};
use crate::workspace::{FileChangeSummary, MergeResult, Workspace};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

impl TaskOrchestrator {
    /// Phase 1. Reuses a workspace left registered by an earlier run.
    pub(super) async fn workspace_setup(
        &self,
        state: &mut RunState,
    ) -> Result<PhaseOutcome, PhaseError> {
        let task_id = &state.task.id;
        let workspace = match self.workspaces.open(task_id) {
            Ok(existing) if existing.path.exists() => {
                info!(
                    task_id = %task_id,
                    path = %existing.path.display(),
                    "Reusing registered workspace"
                );
                existing
            }
            _ => self.workspaces.create(task_id).await?,
        };

        let results = encode(PhaseId::WorkspaceSetup, &workspace)?;
        state.workspace = Some(workspace);
        Ok(PhaseOutcome::Advance(results))
    }

    pub(super) fn agent_payload(
        &self,
        phase: PhaseId,
        state: &RunState,
    ) -> Result<AgentPayload, PhaseError> {
        let task = state.task.clone();
        match phase {
            PhaseId::Planning => Ok(AgentPayload::Plan {
                task,
                workspace_path: require_workspace(state)?.path.clone(),
            }),
            PhaseId::Implementation => {
                let plan: PlanResult = prior_result(state, PhaseId::Planning)?;
                Ok(AgentPayload::Implement {
                    task,
                    plan,
                    workspace_path: require_workspace(state)?.path.clone(),
                })
            }
            PhaseId::CodeReview => {
                let summary: FileChangeSummary = prior_result(state, PhaseId::ChangeSummary)?;
                Ok(AgentPayload::Review { task, summary })
            }
            other => Err(not_an_agent_phase(other)),
        }
    }

    /// Turn a fulfilled response into the phase outcome.
    pub(super) fn accept_response(
        &self,
        phase: PhaseId,
        response: &AgentResponse,
        bridge: &AgentBridge,
    ) -> Result<PhaseOutcome, PhaseError> {
        if !response.success {
            let failure = PhaseFailure::new(
                phase,
                format!("agent reported failure: {}", response.error_message()),
            )
            .with_details(json!({
                "error_type": response.error_type,
                "error": response.error,
            }));
            return Ok(PhaseOutcome::Fail(failure));
        }

        match phase {
            PhaseId::Planning => {
                let plan: PlanResult = bridge.decode(response)?;
                info!(steps = plan.steps.len(), "Plan accepted");
                Ok(PhaseOutcome::Advance(encode(phase, &plan)?))
            }
            PhaseId::Implementation => {
                let result: ImplementationResult = bridge.decode(response)?;
                info!(files = result.files_changed.len(), "Implementation reported");
                Ok(PhaseOutcome::Advance(encode(phase, &result)?))
            }
            PhaseId::CodeReview => {
                let review: ReviewResult = bridge.decode(response)?;
                if review.approved {
                    return Ok(PhaseOutcome::Advance(encode(phase, &review)?));
                }
                let failure = PhaseFailure::new(phase, "code review rejected the changes")
                    .with_details(json!({ "findings": review.findings }));
                Ok(PhaseOutcome::Fail(failure))
            }
            other => Err(not_an_agent_phase(other)),
        }
    }

    pub(super) fn commit_changes(&self, state: &RunState) -> Result<PhaseOutcome, PhaseError> {
        let workspace = require_workspace(state)?;
        let message = format!("[baton] {}: {}", state.task.id, state.task.title);
        let commit = self.workspaces.commit_all(workspace, &message)?;
        Ok(PhaseOutcome::Advance(json!({ "commit": commit })))
    }

    /// Phase 4.5: verify, auto-fix with bounded retries, commit any fixes.
    pub(super) async fn quality_gates(&self, state: &RunState) -> Result<PhaseOutcome, PhaseError> {
        let workspace = require_workspace(state)?;
        let gate = match &self.gate {
            Some(gate) => Some(Arc::clone(gate)),
            None => self
                .config
                .command_gate(&workspace.path)
                .map(|gate| Arc::new(gate) as Arc<dyn QualityGate>),
        };
        let Some(gate) = gate else {
            info!("No verify command configured; skipping quality gates");
            return Ok(PhaseOutcome::Advance(json!({ "skipped": true })));
        };

        let report = run_with_resilience(
            || gate.verify(),
            |details| gate.fix(details),
            self.policy,
        )
        .await;
        let summary = format_guidance(&report);

        if !report.success() {
            warn!(code = %report.code(), "Quality gates failed\n{}", summary);
            let failure = PhaseFailure::new(
                PhaseId::QualityGates,
                format!("quality gates {}", report.outcome),
            )
            .with_details(json!({
                "code": report.code(),
                "guidance": summary,
                "report": report,
            }));
            return Ok(PhaseOutcome::Fail(failure));
        }

        let fix_commit = if report.attempts.is_empty() {
            None
        } else {
            let message = format!("[baton] {}: quality gate fixes", state.task.id);
            self.workspaces.commit_all(workspace, &message)?
        };
        info!(code = %report.code(), attempts = report.attempt_count(), "Quality gates passed");
        Ok(PhaseOutcome::Advance(json!({
            "skipped": false,
            "code": report.code(),
            "fix_commit": fix_commit,
            "report": report,
        })))
    }

    pub(super) fn change_summary(&self, state: &RunState) -> Result<PhaseOutcome, PhaseError> {
        let workspace = require_workspace(state)?;
        let summary = self.workspaces.change_summary(workspace)?;
        if summary.is_empty() {
            return Ok(PhaseOutcome::Fail(PhaseFailure::new(
                PhaseId::ChangeSummary,
                "agent produced no changes",
            )));
        }
        info!(task_id = %state.task.id, "{}", summary.headline());
        Ok(PhaseOutcome::Advance(encode(PhaseId::ChangeSummary, &summary)?))
    }

    /// Phase 7: merge and tear down, or keep the branch when merging is disabled.
    ///
    /// Re-entrant: a run interrupted after the merge or the cleanup picks the
    /// workspace up from the phase 1 results and finishes the remaining steps.
    pub(super) async fn integration(&self, state: &RunState) -> Result<PhaseOutcome, PhaseError> {
        if !self.config.merge_on_success() {
            let workspace = require_workspace(state)?;
            self.workspaces.preserve_on_failure(workspace, "merge disabled")?;
            return Ok(PhaseOutcome::Advance(json!({
                "merged": false,
                "reason": "merge disabled",
                "branch": workspace.branch,
            })));
        }

        let recorded: Workspace;
        let workspace = match &state.workspace {
            Some(workspace) => workspace,
            None => {
                recorded = prior_result(state, PhaseId::WorkspaceSetup)?;
                info!(
                    task_id = %state.task.id,
                    branch = %recorded.branch,
                    "Workspace no longer registered; resuming integration from setup results"
                );
                &recorded
            }
        };

        let check = self.workspaces.check_cleanup(workspace)?;
        let merge = if check.branch_exists && !check.branch_merged {
            self.workspaces.merge(workspace).await?
        } else {
            info!(
                task_id = %state.task.id,
                status = ?check.merge_status,
                "Branch already integrated; skipping merge"
            );
            MergeResult {
                merge_commit: None,
                already_merged: true,
                base_branch: workspace.base_branch.clone(),
            }
        };
        let cleanup = self.workspaces.cleanup(workspace, false).await?;
        Ok(PhaseOutcome::Advance(json!({
            "merged": true,
            "merge": merge,
            "cleanup": cleanup,
        })))
    }
}

fn require_workspace(state: &RunState) -> Result<&Workspace, PhaseError> {
    state
        .workspace
        .as_ref()
        .ok_or_else(|| PhaseError::MissingWorkspace {
            task_id: state.task.id.to_string(),
        })
}

/// Results an earlier phase recorded in `phase_data`.
fn prior_result<T: DeserializeOwned>(state: &RunState, phase: PhaseId) -> Result<T, PhaseError> {
    let malformed = |reason: String| PhaseError::MalformedPhaseData {
        phase: phase.label().to_string(),
        reason,
    };
    let raw = state
        .draft
        .phase_data
        .get(phase.label())
        .ok_or_else(|| malformed("results are missing".to_string()))?;
    serde_json::from_value(raw.clone()).map_err(|e| malformed(e.to_string()))
}

fn not_an_agent_phase(phase: PhaseId) -> PhaseError {
    PhaseError::MalformedPhaseData {
        phase: phase.label().to_string(),
        reason: "phase does not hand work to the agent".to_string(),
    }
}
