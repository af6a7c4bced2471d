//! Durable per-task orchestrator state.
//!
//! One JSON file per task, rewritten in full at every phase boundary and
//! deleted when the task completes.

mod store;

pub use store::CheckpointStore;

use crate::task::{PhaseMarker, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Checkpoint file format version.
pub const CHECKPOINT_VERSION: &str = "1.0";

/// An outstanding agent request recorded in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: Uuid,
    pub phase: PhaseMarker,
    pub requested_at: DateTime<Utc>,
}

/// Persisted checkpoint as it appears on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: String,
    /// Human-readable label, e.g. `implementation_complete`.
    pub checkpoint: String,
    /// Phase to run next.
    pub phase: PhaseMarker,
    #[serde(default)]
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Results of completed phases keyed by phase label.
    #[serde(default)]
    pub phase_data: Map<String, Value>,
    #[serde(default)]
    pub agent_request_pending: Option<PendingRequest>,
}

impl Checkpoint {
    /// Editable copy of the mutable fields, ready to be saved again.
    pub fn to_draft(&self) -> CheckpointDraft {
        CheckpointDraft {
            label: self.checkpoint.clone(),
            phase: self.phase,
            status: self.status,
            config: self.config.clone(),
            phase_data: self.phase_data.clone(),
            pending: self.agent_request_pending.clone(),
        }
    }
}

/// Caller-supplied contents of a checkpoint; timestamps and version are
/// filled in by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointDraft {
    pub label: String,
    pub phase: PhaseMarker,
    pub status: TaskStatus,
    pub config: Map<String, Value>,
    pub phase_data: Map<String, Value>,
    pub pending: Option<PendingRequest>,
}

impl CheckpointDraft {
    pub fn new(label: impl Into<String>, phase: PhaseMarker) -> Self {
        Self {
            label: label.into(),
            phase,
            status: TaskStatus::Active,
            config: Map::new(),
            phase_data: Map::new(),
            pending: None,
        }
    }
}
