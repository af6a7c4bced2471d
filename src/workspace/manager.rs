use super::git::{self, MergeLock};
use super::{
    CleanupCheck, CleanupResult, FileChangeSummary, MergeResult, MergeStatus, Workspace,
    WorkspaceConfig, WorkspaceRecord,
};
use crate::errors::WorkspaceError;
use crate::task::TaskId;
use crate::util::{remove_if_exists, write_atomic};
use chrono::Utc;
use git2::{Oid, Repository};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Creates, merges, preserves and tears down task worktrees.
///
/// Errors are reported to the caller and never retried here.
pub struct WorkspaceManager {
    config: WorkspaceConfig,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn branch_name(&self, task_id: &TaskId) -> String {
        format!("{}/{}", self.config.branch_prefix, task_id)
    }

    pub fn worktree_path(&self, task_id: &TaskId) -> PathBuf {
        self.config.worktrees_dir.join(task_id.as_str())
    }

    fn record_path(&self, task_id: &TaskId) -> PathBuf {
        self.config
            .registry_dir
            .join(format!("{}.json", task_id.as_str()))
    }

    fn open_shared(&self) -> Result<Repository, WorkspaceError> {
        Ok(Repository::open(&self.config.repo_root)?)
    }

    /// Allocate a fresh worktree on `<prefix>/<task_id>` forked from the base branch.
    pub async fn create(&self, task_id: &TaskId) -> Result<Workspace, WorkspaceError> {
        let creation = |reason: String| WorkspaceError::Creation {
            task_id: task_id.to_string(),
            reason,
        };
        let branch = self.branch_name(task_id);
        let path = self.worktree_path(task_id);

        let (base_branch, base_revision) = {
            let repo = Repository::open(&self.config.repo_root).map_err(|e| {
                creation(format!(
                    "cannot open repository at {}: {}",
                    self.config.repo_root.display(),
                    e.message()
                ))
            })?;

            if git::head_commit(&repo).is_none() {
                return Err(creation("repository has no commits".into()));
            }

            let base_branch = match &self.config.base_branch {
                Some(name) => name.clone(),
                None => git::current_branch(&repo).ok_or_else(|| {
                    creation("HEAD is detached; configure a base branch".into())
                })?,
            };
            let base_tip = git::local_branch_tip(&repo, &base_branch)?
                .ok_or_else(|| creation(format!("base branch '{}' does not exist", base_branch)))?;

            if git::has_changes(&repo, false)? {
                return Err(creation(format!(
                    "shared tree at {} has uncommitted changes",
                    self.config.repo_root.display()
                )));
            }

            if self.record_path(task_id).exists() || path.exists() {
                return Err(creation("a workspace already exists for this task".into()));
            }
            if git::local_branch_tip(&repo, &branch)?.is_some() {
                return Err(creation(format!("branch '{}' already exists", branch)));
            }

            (base_branch, base_tip.to_string())
        };

        fs::create_dir_all(&self.config.worktrees_dir).map_err(|e| {
            creation(format!(
                "cannot create {}: {}",
                self.config.worktrees_dir.display(),
                e
            ))
        })?;

        let added = git::run(
            &self.config.repo_root,
            [
                OsStr::new("worktree"),
                OsStr::new("add"),
                path.as_os_str(),
                OsStr::new("-b"),
                OsStr::new(&branch),
                OsStr::new(&base_revision),
            ],
        )
        .await?;
        if !added.success() {
            return Err(creation(format!(
                "git worktree add failed: {}",
                added.stderr.trim()
            )));
        }

        let workspace = Workspace {
            task_id: task_id.clone(),
            path,
            branch,
            base_branch,
            base_revision,
            created_at: Utc::now(),
        };
        self.write_record(&WorkspaceRecord::new(workspace.clone()))?;

        info!(
            task_id = %task_id,
            branch = %workspace.branch,
            base = %workspace.base_branch,
            path = %workspace.path.display(),
            "Created workspace"
        );
        Ok(workspace)
    }

    /// Reload the workspace registered for `task_id`.
    pub fn open(&self, task_id: &TaskId) -> Result<Workspace, WorkspaceError> {
        Ok(self.record(task_id)?.workspace)
    }

    pub fn record(&self, task_id: &TaskId) -> Result<WorkspaceRecord, WorkspaceError> {
        let path = self.record_path(task_id);
        if !path.exists() {
            return Err(WorkspaceError::NotFound {
                task_id: task_id.to_string(),
            });
        }
        read_record(&path)
    }

    fn write_record(&self, record: &WorkspaceRecord) -> Result<(), WorkspaceError> {
        let path = self.record_path(&record.workspace.task_id);
        let json = serde_json::to_vec_pretty(record).map_err(|source| {
            WorkspaceError::RegistryCorrupt {
                path: path.clone(),
                source,
            }
        })?;
        write_atomic(&path, &json).map_err(|source| WorkspaceError::Registry { path, source })
    }

    /// Untracked or modified non-ignored files in the worktree.
    pub fn is_dirty(&self, workspace: &Workspace) -> Result<bool, WorkspaceError> {
        let repo = Repository::open(&workspace.path)?;
        Ok(git::has_changes(&repo, true)?)
    }

    /// Stage and commit everything in the worktree. `None` when nothing changed.
    pub fn commit_all(
        &self,
        workspace: &Workspace,
        message: &str,
    ) -> Result<Option<String>, WorkspaceError> {
        let repo = Repository::open(&workspace.path)?;
        let commit = git::commit_all(&repo, message)?.map(|oid| oid.to_string());
        if let Some(sha) = &commit {
            info!(task_id = %workspace.task_id, commit = %sha, "Committed workspace changes");
        }
        Ok(commit)
    }

    /// Changes on the task branch since it was forked.
    pub fn change_summary(&self, workspace: &Workspace) -> Result<FileChangeSummary, WorkspaceError> {
        let repo = self.open_shared()?;
        let tip = self.branch_tip(&repo, workspace)?;
        let base = Oid::from_str(&workspace.base_revision)?;
        Ok(git::diff_summary(&repo, base, tip)?)
    }

    fn branch_tip(&self, repo: &Repository, workspace: &Workspace) -> Result<Oid, WorkspaceError> {
        git::local_branch_tip(repo, &workspace.branch)?.ok_or_else(|| WorkspaceError::NotFound {
            task_id: workspace.task_id.to_string(),
        })
    }

    /// Branch tip reachable from the base branch tip.
    pub fn is_merged(&self, workspace: &Workspace) -> Result<bool, WorkspaceError> {
        let repo = self.open_shared()?;
        let tip = self.branch_tip(&repo, workspace)?;
        let Some(base_tip) = git::local_branch_tip(&repo, &workspace.base_branch)? else {
            return Ok(false);
        };
        Ok(git::is_ancestor(&repo, tip, base_tip)?)
    }

    /// Merge the task branch into its base branch with `--no-ff`.
    ///
    /// Refuses to touch the shared tree while the workspace is dirty. On a
    /// failed merge the shared tree is restored and the workspace kept.
    pub async fn merge(&self, workspace: &Workspace) -> Result<MergeResult, WorkspaceError> {
        if self.is_dirty(workspace)? {
            return Err(WorkspaceError::UncommittedChanges {
                task_id: workspace.task_id.to_string(),
                path: workspace.path.clone(),
            });
        }

        let lock_path = {
            let repo = self.open_shared()?;
            MergeLock::path_for(&repo)
        };
        let _lock = {
            let path = lock_path.clone();
            tokio::task::spawn_blocking(move || MergeLock::acquire(&path))
                .await
                .map_err(|e| WorkspaceError::Lock {
                    path: lock_path,
                    source: std::io::Error::other(e),
                })??
        };

        let original_branch = {
            let repo = self.open_shared()?;
            if git::has_changes(&repo, false)? {
                return Err(WorkspaceError::SharedTreeDirty {
                    path: self.config.repo_root.clone(),
                });
            }

            let tip = self.branch_tip(&repo, workspace)?;
            if let Some(base_tip) = git::local_branch_tip(&repo, &workspace.base_branch)?
                && git::is_ancestor(&repo, tip, base_tip)?
            {
                info!(task_id = %workspace.task_id, "Branch already merged");
                return Ok(MergeResult {
                    merge_commit: None,
                    already_merged: true,
                    base_branch: workspace.base_branch.clone(),
                });
            }
            git::current_branch(&repo)
        };

        let root = self.config.repo_root.as_path();
        let switched = original_branch.as_deref() != Some(workspace.base_branch.as_str());
        if switched {
            git::run_checked(root, ["checkout", workspace.base_branch.as_str()]).await?;
        }

        let message = format!("Merge {} ({})", workspace.branch, workspace.task_id);
        let merged = git::run(
            root,
            ["merge", "--no-ff", "-m", message.as_str(), workspace.branch.as_str()],
        )
        .await?;

        if !merged.success() {
            let conflicts = git::run(root, ["diff", "--name-only", "--diff-filter=U"])
                .await
                .map(|out| {
                    out.stdout
                        .lines()
                        .filter(|l| !l.trim().is_empty())
                        .map(PathBuf::from)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            if let Err(e) = git::run_checked(root, ["merge", "--abort"]).await {
                warn!(error = %e, "git merge --abort failed; shared tree may need attention");
            }
            self.restore_branch(root, switched, original_branch.as_deref())
                .await;

            if conflicts.is_empty() {
                return Err(WorkspaceError::GitCommand {
                    args: merged.args,
                    code: merged.code,
                    stderr: merged.stderr.trim().to_string(),
                });
            }
            warn!(
                task_id = %workspace.task_id,
                conflicts = conflicts.len(),
                "Merge conflicted; workspace kept"
            );
            return Err(WorkspaceError::MergeConflict {
                task_id: workspace.task_id.to_string(),
                branch: workspace.branch.clone(),
                base_branch: workspace.base_branch.clone(),
                conflicts,
            });
        }

        let merge_commit = git::run_checked(root, ["rev-parse", "HEAD"]).await?;
        self.restore_branch(root, switched, original_branch.as_deref())
            .await;

        info!(
            task_id = %workspace.task_id,
            commit = %merge_commit,
            base = %workspace.base_branch,
            "Merged workspace branch"
        );
        Ok(MergeResult {
            merge_commit: Some(merge_commit),
            already_merged: false,
            base_branch: workspace.base_branch.clone(),
        })
    }

    async fn restore_branch(&self, root: &Path, switched: bool, original: Option<&str>) {
        if !switched {
            return;
        }
        if let Some(original) = original
            && let Err(e) = git::run_checked(root, ["checkout", original]).await
        {
            warn!(branch = original, error = %e, "Failed to restore original branch");
        }
    }

    /// Mark the workspace as kept for inspection. Never deletes anything.
    ///
    /// Repeated calls keep the first `preserved_at` and the latest reason.
    pub fn preserve_on_failure(
        &self,
        workspace: &Workspace,
        reason: &str,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let mut record = match self.record(&workspace.task_id) {
            Ok(record) => record,
            Err(WorkspaceError::NotFound { .. }) => WorkspaceRecord::new(workspace.clone()),
            Err(e) => return Err(e),
        };
        record.preserved = true;
        record.preserved_reason = Some(reason.to_string());
        record.preserved_at.get_or_insert_with(Utc::now);
        self.write_record(&record)?;

        warn!(
            task_id = %workspace.task_id,
            path = %workspace.path.display(),
            reason,
            "Workspace preserved for inspection"
        );
        Ok(record)
    }

    /// Evaluate the cleanup safety checks without changing anything.
    pub fn check_cleanup(&self, workspace: &Workspace) -> Result<CleanupCheck, WorkspaceError> {
        let worktree_exists = workspace.path.exists();
        let has_uncommitted_changes = worktree_exists && self.is_dirty(workspace)?;

        let repo = self.open_shared()?;
        let tip = git::local_branch_tip(&repo, &workspace.branch)?;
        let base_tip = git::local_branch_tip(&repo, &workspace.base_branch)?;
        let branch_merged = match (tip, base_tip) {
            (Some(tip), Some(base_tip)) => git::is_ancestor(&repo, tip, base_tip)?,
            _ => false,
        };
        let merge_status = match (tip.is_some(), branch_merged) {
            (false, _) => MergeStatus::BranchMissing,
            (true, true) => MergeStatus::Merged,
            (true, false) => MergeStatus::Unmerged,
        };

        Ok(CleanupCheck {
            worktree_exists,
            has_uncommitted_changes,
            branch_exists: tip.is_some(),
            branch_merged,
            merge_status,
        })
    }

    /// Remove the worktree, its branch and its registry record.
    ///
    /// Unless `force`, refuses when the worktree is dirty or the branch holds
    /// commits the base branch does not.
    pub async fn cleanup(
        &self,
        workspace: &Workspace,
        force: bool,
    ) -> Result<CleanupResult, WorkspaceError> {
        let check = self.check_cleanup(workspace)?;

        if !force {
            if check.has_uncommitted_changes {
                return Err(WorkspaceError::UncommittedChanges {
                    task_id: workspace.task_id.to_string(),
                    path: workspace.path.clone(),
                });
            }
            if check.branch_exists && !check.branch_merged {
                return Err(WorkspaceError::UnmergedBranch {
                    task_id: workspace.task_id.to_string(),
                    branch: workspace.branch.clone(),
                    base_branch: workspace.base_branch.clone(),
                });
            }
        }

        let root = self.config.repo_root.as_path();

        if check.worktree_exists {
            let mut args = vec![OsStr::new("worktree"), OsStr::new("remove")];
            if force {
                args.push(OsStr::new("--force"));
            }
            args.push(workspace.path.as_os_str());
            git::run_checked(root, args).await?;
        }

        if check.branch_exists {
            let flag = if force { "-D" } else { "-d" };
            git::run_checked(root, ["branch", flag, workspace.branch.as_str()]).await?;
        }

        git::run_checked(root, ["worktree", "prune"]).await?;

        let record_path = self.record_path(&workspace.task_id);
        remove_if_exists(&record_path).map_err(|source| WorkspaceError::Registry {
            path: record_path,
            source,
        })?;

        info!(task_id = %workspace.task_id, forced = force, "Cleaned up workspace");
        Ok(CleanupResult {
            worktree_removed: check.worktree_exists,
            branch_deleted: check.branch_exists,
            forced: force,
            check,
        })
    }

    /// All registered workspaces, sorted by task id. Unreadable records are skipped.
    pub fn list(&self) -> Result<Vec<WorkspaceRecord>, WorkspaceError> {
        let dir = &self.config.registry_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(dir).map_err(|source| WorkspaceError::Registry {
            path: dir.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping workspace record"),
            }
        }
        records.sort_by(|a, b| a.workspace.task_id.cmp(&b.workspace.task_id));
        Ok(records)
    }
}

fn read_record(path: &Path) -> Result<WorkspaceRecord, WorkspaceError> {
    let content = fs::read_to_string(path).map_err(|source| WorkspaceError::Registry {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| WorkspaceError::RegistryCorrupt {
        path: path.to_path_buf(),
        source,
    })
}
