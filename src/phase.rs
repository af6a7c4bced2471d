//! The fixed phase table and the typed values phases exchange.
//!
//! This module provides:
//! - `PhaseId`, the ordered table of phases with markers, labels and resumability
//! - `PhaseOutcome` / `PhaseFailure`, what a single phase returns to the driver
//! - `PlanResult`, `ImplementationResult` and `ReviewResult`, the response
//!   shapes the agent phases accept

use crate::task::PhaseMarker;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

use crate::handoff::AgentPayload;

/// How a phase gets its work done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// Runs entirely inside the orchestrator.
    Local,
    /// Hands work to the external agent and suspends.
    Agent,
    /// Runs the verify/fix resilience loop.
    Resilience,
}

/// The ordered phases every task goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhaseId {
    WorkspaceSetup,
    Planning,
    Implementation,
    CommitChanges,
    QualityGates,
    ChangeSummary,
    CodeReview,
    Integration,
}

impl PhaseId {
    pub const ALL: [PhaseId; 8] = [
        PhaseId::WorkspaceSetup,
        PhaseId::Planning,
        PhaseId::Implementation,
        PhaseId::CommitChanges,
        PhaseId::QualityGates,
        PhaseId::ChangeSummary,
        PhaseId::CodeReview,
        PhaseId::Integration,
    ];

    pub fn first() -> Self {
        PhaseId::WorkspaceSetup
    }

    pub fn marker(self) -> PhaseMarker {
        match self {
            PhaseId::WorkspaceSetup => PhaseMarker::new(1),
            PhaseId::Planning => PhaseMarker::new(2),
            PhaseId::Implementation => PhaseMarker::new(3),
            PhaseId::CommitChanges => PhaseMarker::new(4),
            PhaseId::QualityGates => PhaseMarker::sub(4, 5),
            PhaseId::ChangeSummary => PhaseMarker::new(5),
            PhaseId::CodeReview => PhaseMarker::new(6),
            PhaseId::Integration => PhaseMarker::new(7),
        }
    }

    /// Key used in `phase_data` and checkpoint labels.
    pub fn label(self) -> &'static str {
        match self {
            PhaseId::WorkspaceSetup => "workspace_setup",
            PhaseId::Planning => "planning",
            PhaseId::Implementation => "implementation",
            PhaseId::CommitChanges => "commit_changes",
            PhaseId::QualityGates => "quality_gates",
            PhaseId::ChangeSummary => "change_summary",
            PhaseId::CodeReview => "code_review",
            PhaseId::Integration => "integration",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            PhaseId::WorkspaceSetup => "Allocate the isolated workspace",
            PhaseId::Planning => "Agent drafts an implementation plan",
            PhaseId::Implementation => "Agent implements the plan in the workspace",
            PhaseId::CommitChanges => "Commit workspace changes",
            PhaseId::QualityGates => "Verify and auto-fix with bounded retries",
            PhaseId::ChangeSummary => "Summarize changes on the task branch",
            PhaseId::CodeReview => "Agent reviews the change set",
            PhaseId::Integration => "Merge into the base branch and clean up",
        }
    }

    pub fn kind(self) -> PhaseKind {
        match self {
            PhaseId::Planning | PhaseId::Implementation | PhaseId::CodeReview => PhaseKind::Agent,
            PhaseId::QualityGates => PhaseKind::Resilience,
            _ => PhaseKind::Local,
        }
    }

    /// Whether a checkpoint pointing at this phase may be resumed.
    ///
    /// Workspace setup never is: a checkpoint only exists once setup has run.
    pub fn is_resumable(self) -> bool {
        !matches!(self, PhaseId::WorkspaceSetup)
    }

    pub fn next(self) -> Option<PhaseId> {
        let idx = Self::ALL.iter().position(|p| *p == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    pub fn from_marker(marker: PhaseMarker) -> Option<PhaseId> {
        Self::ALL.into_iter().find(|p| p.marker() == marker)
    }

    pub fn from_label(label: &str) -> Option<PhaseId> {
        Self::ALL.into_iter().find(|p| p.label() == label)
    }

    /// Checkpoint label written once this phase has finished.
    pub fn complete_label(self) -> String {
        format!("{}_complete", self.label())
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.marker(), self.label())
    }
}

/// Why a phase failed. Recorded in `phase_data.failure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub phase: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl PhaseFailure {
    pub fn new(phase: PhaseId, reason: impl Into<String>) -> Self {
        Self {
            phase: phase.label().to_string(),
            reason: reason.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Result of running one phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// Phase finished; the value is stored under the phase label.
    Advance(Value),
    /// Phase needs the external agent before it can finish.
    RequestAgent(AgentPayload),
    Fail(PhaseFailure),
}

/// A typed agent response payload that checks its own shape.
pub trait AgentResult: DeserializeOwned {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub summary: String,
    pub steps: Vec<String>,
}

impl AgentResult for PlanResult {
    fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("plan has no steps".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationResult {
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<PathBuf>,
}

impl AgentResult for ImplementationResult {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub approved: bool,
    #[serde(default)]
    pub findings: Vec<String>,
}

impl AgentResult for ReviewResult {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_table_is_strictly_ordered() {
        for pair in PhaseId::ALL.windows(2) {
            assert!(pair[0].marker() < pair[1].marker());
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(PhaseId::Integration.next(), None);
    }

    #[test]
    fn test_quality_gates_is_sub_phase() {
        assert_eq!(PhaseId::QualityGates.marker().to_string(), "4.5");
        assert_eq!(PhaseId::CommitChanges.next(), Some(PhaseId::QualityGates));
        assert_eq!(PhaseId::QualityGates.kind(), PhaseKind::Resilience);
    }

    #[test]
    fn test_from_marker_round_trips() {
        for phase in PhaseId::ALL {
            assert_eq!(PhaseId::from_marker(phase.marker()), Some(phase));
            assert_eq!(PhaseId::from_label(phase.label()), Some(phase));
        }
        assert_eq!(PhaseId::from_marker(PhaseMarker::sub(2, 5)), None);
        assert_eq!(PhaseId::from_marker(PhaseMarker::new(8)), None);
    }

    #[test]
    fn test_only_workspace_setup_is_not_resumable() {
        let not_resumable: Vec<_> = PhaseId::ALL
            .into_iter()
            .filter(|p| !p.is_resumable())
            .collect();
        assert_eq!(not_resumable, vec![PhaseId::WorkspaceSetup]);
    }

    #[test]
    fn test_agent_phases() {
        let agents: Vec<_> = PhaseId::ALL
            .into_iter()
            .filter(|p| p.kind() == PhaseKind::Agent)
            .map(|p| p.label())
            .collect();
        assert_eq!(agents, vec!["planning", "implementation", "code_review"]);
    }

    #[test]
    fn test_plan_result_requires_steps() {
        let empty = PlanResult {
            summary: "nothing".into(),
            steps: vec![],
        };
        assert!(empty.validate().is_err());

        let plan: PlanResult =
            serde_json::from_str(r#"{"summary": "s", "steps": ["write code"]}"#).unwrap();
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_display_and_complete_label() {
        assert_eq!(PhaseId::CodeReview.to_string(), "6 (code_review)");
        assert_eq!(
            PhaseId::Implementation.complete_label(),
            "implementation_complete"
        );
    }

    #[test]
    fn test_phase_failure_omits_null_details() {
        let failure = PhaseFailure::new(PhaseId::ChangeSummary, "agent produced no changes");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["phase"], "change_summary");
        assert!(json.get("details").is_none());
    }
}
