//! File-based request/response handoff with the external agent.
//!
//! A phase that needs agent work writes `.agent-request-phase{N}.json`, the
//! process exits with [`AGENT_REQUIRED_EXIT_CODE`], and the host supervisor
//! runs the agent, which writes `.agent-response-phase{N}.json`. On the next
//! invocation the orchestrator polls for that response and resumes the phase.
//!
//! State machine per phase:
//! - `None` -> `Requested` when the request file is written
//! - `Requested` -> `Requested` while no matching response exists
//! - `Requested` -> `Fulfilled` when a response for the same phase is found
//! - `Fulfilled` -> `None` once the phase consumes the response

use crate::checkpoint::PendingRequest;
use crate::errors::HandoffError;
use crate::phase::{AgentResult, PlanResult};
use crate::task::{PhaseMarker, Task, TaskId};
use crate::util::{remove_if_exists, write_atomic};
use crate::workspace::FileChangeSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// The only exit status meaning "waiting on external agent work".
pub const AGENT_REQUIRED_EXIT_CODE: i32 = 42;

pub const HANDOFF_VERSION: &str = "1.0";

/// Work description handed to the agent, one variant per agent phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentPayload {
    Plan {
        task: Task,
        workspace_path: PathBuf,
    },
    Implement {
        task: Task,
        plan: PlanResult,
        workspace_path: PathBuf,
    },
    Review {
        task: Task,
        summary: FileChangeSummary,
    },
}

/// Request file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub version: String,
    pub request_id: Uuid,
    pub task_id: TaskId,
    pub phase: PhaseMarker,
    pub phase_name: String,
    pub created_at: DateTime<Utc>,
    /// Where the agent must write its response.
    pub response_path: PathBuf,
    pub payload: AgentPayload,
}

/// Response file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub phase: PhaseMarker,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl AgentResponse {
    /// Error text for a failed response.
    pub fn error_message(&self) -> String {
        match (&self.error_type, &self.error) {
            (Some(kind), Some(msg)) => format!("{}: {}", kind, msg),
            (None, Some(msg)) => msg.clone(),
            (Some(kind), None) => kind.clone(),
            (None, None) => "agent reported failure without details".to_string(),
        }
    }
}

/// Why a pending request is not yet fulfilled.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitReason {
    NoResponse,
    PhaseMismatch {
        expected: PhaseMarker,
        found: PhaseMarker,
    },
    RequestMismatch {
        expected: Uuid,
        found: Uuid,
    },
    MissingSuccessFlag,
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitReason::NoResponse => write!(f, "no response yet"),
            WaitReason::PhaseMismatch { expected, found } => {
                write!(f, "response is for phase {}, expected {}", found, expected)
            }
            WaitReason::RequestMismatch { expected, found } => {
                write!(f, "response answers request {}, expected {}", found, expected)
            }
            WaitReason::MissingSuccessFlag => write!(f, "response has no success flag"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandoffPoll {
    Fulfilled(AgentResponse),
    Waiting(WaitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    None,
    Requested,
    Fulfilled,
}

impl HandoffState {
    pub fn of(pending: Option<&PendingRequest>, poll: Option<&HandoffPoll>) -> Self {
        match (pending, poll) {
            (None, _) => HandoffState::None,
            (Some(_), Some(HandoffPoll::Fulfilled(_))) => HandoffState::Fulfilled,
            (Some(_), _) => HandoffState::Requested,
        }
    }
}

/// Reads and writes handoff files for one task under `<root>/<task_id>/`.
pub struct AgentBridge {
    dir: PathBuf,
}

impl AgentBridge {
    pub fn new(root: &Path, task_id: &TaskId) -> Self {
        Self {
            dir: root.join(task_id.as_str()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn request_path(&self, phase: PhaseMarker) -> PathBuf {
        self.dir.join(format!(".agent-request-phase{}.json", phase))
    }

    pub fn response_path(&self, phase: PhaseMarker) -> PathBuf {
        self.dir.join(format!(".agent-response-phase{}.json", phase))
    }

    /// Write the request file and drop any stale response for the phase.
    pub fn request(
        &self,
        task_id: &TaskId,
        phase: PhaseMarker,
        phase_name: &str,
        payload: AgentPayload,
    ) -> Result<PendingRequest, HandoffError> {
        let response_path = self.response_path(phase);
        remove_if_exists(&response_path).map_err(|source| HandoffError::Io {
            path: response_path.clone(),
            source,
        })?;

        let request = AgentRequest {
            version: HANDOFF_VERSION.to_string(),
            request_id: Uuid::new_v4(),
            task_id: task_id.clone(),
            phase,
            phase_name: phase_name.to_string(),
            created_at: Utc::now(),
            response_path,
            payload,
        };

        let path = self.request_path(phase);
        let json = serde_json::to_vec_pretty(&request).map_err(HandoffError::Serialize)?;
        write_atomic(&path, &json).map_err(|source| HandoffError::Io {
            path: path.clone(),
            source,
        })?;

        info!(
            task_id = %task_id,
            phase = %phase,
            request_id = %request.request_id,
            path = %path.display(),
            "Wrote agent request"
        );
        Ok(PendingRequest {
            request_id: request.request_id,
            phase,
            requested_at: request.created_at,
        })
    }

    /// Check whether the agent has answered `pending`.
    ///
    /// Mismatched or incomplete responses leave the request waiting. A file
    /// that is not JSON, or that carries a success flag but does not fit the
    /// response shape, is an error.
    pub fn poll(&self, pending: &PendingRequest) -> Result<HandoffPoll, HandoffError> {
        let path = self.response_path(pending.phase);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HandoffPoll::Waiting(WaitReason::NoResponse));
            }
            Err(source) => return Err(HandoffError::Io { path, source }),
        };

        let invalid = |reason: String| HandoffError::InvalidResponse {
            path: path.clone(),
            reason,
        };

        let value: Value =
            serde_json::from_str(&content).map_err(|e| invalid(format!("not valid JSON: {}", e)))?;
        let Some(object) = value.as_object() else {
            return Err(invalid("response is not a JSON object".into()));
        };

        let found = object
            .get("phase")
            .ok_or_else(|| invalid("missing phase".into()))
            .and_then(|raw| {
                serde_json::from_value::<PhaseMarker>(raw.clone())
                    .map_err(|e| invalid(format!("bad phase: {}", e)))
            })?;
        if found != pending.phase {
            debug!(expected = %pending.phase, found = %found, "Ignoring response for another phase");
            return Ok(HandoffPoll::Waiting(WaitReason::PhaseMismatch {
                expected: pending.phase,
                found,
            }));
        }

        if let Some(raw) = object.get("request_id").filter(|v| !v.is_null()) {
            let found = serde_json::from_value::<Uuid>(raw.clone())
                .map_err(|e| invalid(format!("bad request_id: {}", e)))?;
            if found != pending.request_id {
                return Ok(HandoffPoll::Waiting(WaitReason::RequestMismatch {
                    expected: pending.request_id,
                    found,
                }));
            }
        }

        if object.get("success").is_none_or(Value::is_null) {
            return Ok(HandoffPoll::Waiting(WaitReason::MissingSuccessFlag));
        }

        let response: AgentResponse =
            serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
        if response.success && response.payload.is_none() {
            return Err(invalid("successful response has no payload".into()));
        }

        info!(phase = %pending.phase, success = response.success, "Agent response received");
        Ok(HandoffPoll::Fulfilled(response))
    }

    /// Decode and validate a fulfilled payload against the phase's expected shape.
    pub fn decode<T: AgentResult>(&self, response: &AgentResponse) -> Result<T, HandoffError> {
        let path = self.response_path(response.phase);
        let raw = response
            .payload
            .clone()
            .ok_or_else(|| HandoffError::InvalidResponse {
                path: path.clone(),
                reason: "response has no payload".into(),
            })?;
        let result: T = serde_json::from_value(raw).map_err(|e| HandoffError::InvalidResponse {
            path: path.clone(),
            reason: format!("payload does not match expected shape: {}", e),
        })?;
        result
            .validate()
            .map_err(|reason| HandoffError::InvalidResponse { path, reason })?;
        Ok(result)
    }

    /// Remove request and response files for a phase once consumed.
    pub fn consume(&self, phase: PhaseMarker) -> Result<(), HandoffError> {
        for path in [self.request_path(phase), self.response_path(phase)] {
            remove_if_exists(&path).map_err(|source| HandoffError::Io {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Remove every handoff file for the task.
    pub fn clear(&self) -> Result<(), HandoffError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HandoffError::Io {
                path: self.dir.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::ReviewResult;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (AgentBridge, TaskId, TempDir) {
        let dir = tempdir().unwrap();
        let task_id = TaskId::new("T1").unwrap();
        let bridge = AgentBridge::new(dir.path(), &task_id);
        (bridge, task_id, dir)
    }

    fn review_payload(task_id: &TaskId) -> AgentPayload {
        AgentPayload::Review {
            task: Task::new(task_id.clone(), "Add feature", ""),
            summary: FileChangeSummary::default(),
        }
    }

    fn write_response(bridge: &AgentBridge, phase: PhaseMarker, body: Value) {
        fs::create_dir_all(bridge.dir()).unwrap();
        fs::write(bridge.response_path(phase), body.to_string()).unwrap();
    }

    #[test]
    fn test_file_names_use_marker_display() {
        let (bridge, _, _dir) = setup();
        assert!(
            bridge
                .request_path(PhaseMarker::new(6))
                .ends_with("T1/.agent-request-phase6.json")
        );
        assert!(
            bridge
                .response_path(PhaseMarker::sub(4, 5))
                .ends_with("T1/.agent-response-phase4.5.json")
        );
    }

    #[test]
    fn test_request_writes_tagged_payload() {
        let (bridge, task_id, _dir) = setup();
        let pending = bridge
            .request(&task_id, PhaseMarker::new(6), "code_review", review_payload(&task_id))
            .unwrap();

        let raw = fs::read_to_string(bridge.request_path(PhaseMarker::new(6))).unwrap();
        let request: AgentRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(request.request_id, pending.request_id);
        assert_eq!(request.phase, PhaseMarker::new(6));

        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["payload"]["kind"], "review");
        assert_eq!(value["phase"], 6);
    }

    #[test]
    fn test_request_removes_stale_response() {
        let (bridge, task_id, _dir) = setup();
        let phase = PhaseMarker::new(6);
        write_response(&bridge, phase, json!({"phase": 6, "success": true, "payload": {}}));

        let pending = bridge
            .request(&task_id, phase, "code_review", review_payload(&task_id))
            .unwrap();
        assert_eq!(
            bridge.poll(&pending).unwrap(),
            HandoffPoll::Waiting(WaitReason::NoResponse)
        );
    }

    #[test]
    fn test_poll_fulfilled_and_decode() {
        let (bridge, task_id, _dir) = setup();
        let phase = PhaseMarker::new(6);
        let pending = bridge
            .request(&task_id, phase, "code_review", review_payload(&task_id))
            .unwrap();
        write_response(
            &bridge,
            phase,
            json!({
                "phase": 6,
                "success": true,
                "request_id": pending.request_id,
                "payload": {"approved": true, "findings": []}
            }),
        );

        let HandoffPoll::Fulfilled(response) = bridge.poll(&pending).unwrap() else {
            panic!("Expected fulfilled response");
        };
        let review: ReviewResult = bridge.decode(&response).unwrap();
        assert!(review.approved);
        assert_eq!(
            HandoffState::of(Some(&pending), Some(&HandoffPoll::Fulfilled(response))),
            HandoffState::Fulfilled
        );

        bridge.consume(phase).unwrap();
        assert!(!bridge.request_path(phase).exists());
        assert!(!bridge.response_path(phase).exists());
    }

    #[test]
    fn test_poll_never_accepts_other_phase() {
        let (bridge, _, _dir) = setup();
        let markers = [
            PhaseMarker::new(2),
            PhaseMarker::new(3),
            PhaseMarker::sub(4, 5),
            PhaseMarker::new(6),
        ];
        for expected in markers {
            for found in markers.into_iter().filter(|m| *m != expected) {
                let pending = PendingRequest {
                    request_id: Uuid::new_v4(),
                    phase: expected,
                    requested_at: Utc::now(),
                };
                // Misfiled response: sits at the expected path but names another phase.
                write_response(
                    &bridge,
                    expected,
                    json!({"phase": found, "success": true, "payload": {}}),
                );
                assert_eq!(
                    bridge.poll(&pending).unwrap(),
                    HandoffPoll::Waiting(WaitReason::PhaseMismatch { expected, found })
                );
            }
        }
    }

    #[test]
    fn test_poll_waits_on_missing_success_flag() {
        let (bridge, task_id, _dir) = setup();
        let phase = PhaseMarker::new(2);
        let pending = bridge
            .request(&task_id, phase, "planning", review_payload(&task_id))
            .unwrap();
        write_response(&bridge, phase, json!({"phase": 2, "payload": {}}));

        let poll = bridge.poll(&pending).unwrap();
        assert_eq!(poll, HandoffPoll::Waiting(WaitReason::MissingSuccessFlag));
        assert_eq!(
            HandoffState::of(Some(&pending), Some(&poll)),
            HandoffState::Requested
        );
    }

    #[test]
    fn test_poll_waits_on_other_request_id() {
        let (bridge, task_id, _dir) = setup();
        let phase = PhaseMarker::new(3);
        let pending = bridge
            .request(&task_id, phase, "implementation", review_payload(&task_id))
            .unwrap();
        write_response(
            &bridge,
            phase,
            json!({"phase": 3, "success": true, "request_id": Uuid::new_v4(), "payload": {}}),
        );

        assert!(matches!(
            bridge.poll(&pending).unwrap(),
            HandoffPoll::Waiting(WaitReason::RequestMismatch { .. })
        ));
    }

    #[test]
    fn test_poll_rejects_invalid_json() {
        let (bridge, _, _dir) = setup();
        let phase = PhaseMarker::new(6);
        fs::create_dir_all(bridge.dir()).unwrap();
        fs::write(bridge.response_path(phase), "{ truncated").unwrap();
        let pending = PendingRequest {
            request_id: Uuid::new_v4(),
            phase,
            requested_at: Utc::now(),
        };

        let err = bridge.poll(&pending).unwrap_err();
        assert!(matches!(err, HandoffError::InvalidResponse { .. }));
    }

    #[test]
    fn test_poll_rejects_success_without_payload() {
        let (bridge, _, _dir) = setup();
        let phase = PhaseMarker::new(6);
        write_response(&bridge, phase, json!({"phase": 6, "success": true}));
        let pending = PendingRequest {
            request_id: Uuid::new_v4(),
            phase,
            requested_at: Utc::now(),
        };
        assert!(bridge.poll(&pending).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let (bridge, _, _dir) = setup();
        let response = AgentResponse {
            phase: PhaseMarker::new(2),
            success: true,
            payload: Some(json!({"summary": "s", "steps": []})),
            error: None,
            request_id: None,
            version: None,
            error_type: None,
            duration_seconds: None,
            created_at: None,
        };
        let err = bridge.decode::<PlanResult>(&response).unwrap_err();
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn test_failed_response_error_message() {
        let response: AgentResponse = serde_json::from_value(json!({
            "phase": 3,
            "success": false,
            "error": "model refused",
            "error_type": "AgentError"
        }))
        .unwrap();
        assert_eq!(response.error_message(), "AgentError: model refused");
    }

    #[test]
    fn test_handoff_state_none_without_pending() {
        assert_eq!(HandoffState::of(None, None), HandoffState::None);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (bridge, task_id, _dir) = setup();
        bridge
            .request(&task_id, PhaseMarker::new(6), "code_review", review_payload(&task_id))
            .unwrap();
        bridge.clear().unwrap();
        bridge.clear().unwrap();
        assert!(!bridge.dir().exists());
    }
}
