use super::{CHECKPOINT_VERSION, Checkpoint, CheckpointDraft};
use crate::errors::CheckpointError;
use crate::task::TaskId;
use crate::util::{remove_if_exists, write_atomic};
use chrono::{DateTime, Utc};
use serde_json::Value;
use serde_json::error::Category;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File-backed checkpoint store: `<dir>/<task_id>.json`.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", task_id.as_str()))
    }

    /// Overwrite the checkpoint for `task_id`.
    ///
    /// `created_at` is carried over from the existing file. An existing file
    /// that cannot be read is replaced, with `created_at` reset to now.
    pub fn save(
        &self,
        task_id: &TaskId,
        draft: &CheckpointDraft,
    ) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(task_id);
        let now = Utc::now();
        let created_at = if path.exists() {
            existing_created_at(&path).unwrap_or_else(|| {
                warn!(
                    path = %path.display(),
                    "Existing checkpoint is unreadable; overwriting with fresh created_at"
                );
                now
            })
        } else {
            now
        };

        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION.to_string(),
            checkpoint: draft.label.clone(),
            phase: draft.phase,
            status: draft.status,
            created_at,
            updated_at: now,
            config: draft.config.clone(),
            phase_data: draft.phase_data.clone(),
            agent_request_pending: draft.pending.clone(),
        };

        let json = serde_json::to_vec_pretty(&checkpoint).map_err(CheckpointError::Serialize)?;
        write_atomic(&path, &json).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(
            task_id = %task_id,
            phase = %checkpoint.phase,
            label = %checkpoint.checkpoint,
            "Saved checkpoint"
        );
        Ok(checkpoint)
    }

    /// Load and validate the checkpoint for `task_id`.
    pub fn load(&self, task_id: &TaskId) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(task_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound {
                    task_id: task_id.to_string(),
                    path,
                });
            }
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };

        let checkpoint: Checkpoint = match serde_json::from_str(&content) {
            Ok(checkpoint) => checkpoint,
            Err(e) if e.classify() == Category::Data => {
                return Err(CheckpointError::Invalid {
                    path,
                    reason: e.to_string(),
                });
            }
            Err(source) => return Err(CheckpointError::Corrupt { path, source }),
        };

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Invalid {
                path,
                reason: format!(
                    "unsupported version '{}' (expected '{}')",
                    checkpoint.version, CHECKPOINT_VERSION
                ),
            });
        }
        if let Some(pending) = &checkpoint.agent_request_pending
            && pending.phase != checkpoint.phase
        {
            return Err(CheckpointError::Invalid {
                path,
                reason: format!(
                    "pending agent request is for phase {} but checkpoint is at phase {}",
                    pending.phase, checkpoint.phase
                ),
            });
        }

        Ok(checkpoint)
    }

    pub fn exists(&self, task_id: &TaskId) -> bool {
        self.path_for(task_id).exists()
    }

    /// Delete the checkpoint. Safe to call when none exists.
    pub fn cleanup(&self, task_id: &TaskId) -> Result<(), CheckpointError> {
        let path = self.path_for(task_id);
        if remove_if_exists(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })? {
            debug!(task_id = %task_id, "Removed checkpoint");
        }
        Ok(())
    }

    /// Tasks that currently have a checkpoint file, sorted.
    pub fn list(&self) -> Result<Vec<TaskId>, CheckpointError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut ids: Vec<TaskId> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?;
                TaskId::new(stem).ok()
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn existing_created_at(path: &Path) -> Option<DateTime<Utc>> {
    let content = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&content).ok()?;
    let raw = value.get("created_at")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
