//! Core task model: identifiers, lifecycle status and phase markers.

use crate::errors::ValidationError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const MAX_TASK_ID_LEN: usize = 64;

/// Stable task identifier.
///
/// Task ids end up in branch names and file names, so only ASCII
/// alphanumerics, `-`, `_` and `.` are accepted, and the id may not start
/// with `.` or `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        let invalid = |reason: &str| ValidationError::InvalidTaskId {
            id: id.clone(),
            reason: reason.to_string(),
        };

        if id.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if id.len() > MAX_TASK_ID_LEN {
            return Err(invalid("must be at most 64 characters"));
        }
        if id.starts_with('.') || id.starts_with('-') {
            return Err(invalid("must not start with '.' or '-'"));
        }
        if id.contains("..") {
            return Err(invalid("must not contain '..'"));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(invalid(&format!("contains unsupported character '{}'", bad)));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

/// Task lifecycle status, persisted in the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    #[default]
    Active,
    AwaitingAgent,
    Completed,
    Failed,
    PreservedForInspection,
}

impl TaskStatus {
    /// Closed tasks never resume; they have to be reset first.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::PreservedForInspection
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::AwaitingAgent => "awaiting-agent",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::PreservedForInspection => "preserved-for-inspection",
        };
        f.write_str(s)
    }
}

/// Ordered phase identifier with one decimal place of precision.
///
/// Stored as tenths so markers are `Eq + Ord + Hash`; `4.5` is `PhaseMarker(45)`.
/// Serialized as a JSON number: integral markers as integers (`6`),
/// fractional ones as floats (`4.5`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhaseMarker(u32);

impl PhaseMarker {
    /// Integral marker, e.g. `PhaseMarker::new(6)`.
    pub const fn new(whole: u32) -> Self {
        Self(whole * 10)
    }

    /// Fractional sub-phase marker, e.g. `PhaseMarker::sub(4, 5)` for 4.5.
    pub const fn sub(whole: u32, tenth: u32) -> Self {
        Self(whole * 10 + tenth % 10)
    }

    pub fn from_f64(value: f64) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidPhaseMarker {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if !value.is_finite() {
            return Err(invalid("must be finite"));
        }
        if value < 0.0 {
            return Err(invalid("must not be negative"));
        }
        let scaled = value * 10.0;
        let tenths = scaled.round();
        if (scaled - tenths).abs() > 1e-6 {
            return Err(invalid("supports at most one decimal place"));
        }
        if tenths > f64::from(u32::MAX) {
            return Err(invalid("is too large"));
        }
        Ok(Self(tenths as u32))
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.0) / 10.0
    }

    pub fn is_fractional(&self) -> bool {
        self.0 % 10 != 0
    }
}

impl fmt::Display for PhaseMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_fractional() {
            write!(f, "{}.{}", self.0 / 10, self.0 % 10)
        } else {
            write!(f, "{}", self.0 / 10)
        }
    }
}

impl FromStr for PhaseMarker {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| ValidationError::InvalidPhaseMarker {
                value: s.to_string(),
                reason: "not a number".to_string(),
            })?;
        Self::from_f64(value)
    }
}

impl Serialize for PhaseMarker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_fractional() {
            serializer.serialize_f64(self.as_f64())
        } else {
            serializer.serialize_u32(self.0 / 10)
        }
    }
}

impl<'de> Deserialize<'de> for PhaseMarker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        PhaseMarker::from_f64(value).map_err(serde::de::Error::custom)
    }
}

/// A unit of work admitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl Task {
    pub fn new(id: TaskId, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: description.into(),
        }
    }
}
