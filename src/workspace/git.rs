use super::FileChangeSummary;
use crate::errors::WorkspaceError;
use git2::{
    BranchType, Delta, DiffOptions, ErrorCode, Oid, Repository, Signature, Status, StatusOptions,
};
use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Captured result of a `git` CLI invocation.
#[derive(Debug)]
pub(super) struct GitOutput {
    pub args: String,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Trimmed stdout, or `GitCommand` when git exited non-zero.
    pub fn checked(self) -> Result<String, WorkspaceError> {
        if self.success() {
            Ok(self.stdout.trim().to_string())
        } else {
            Err(WorkspaceError::GitCommand {
                args: self.args,
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run `git <args>` in `cwd` without interpreting the exit status.
pub(super) async fn run<I, S>(cwd: &Path, args: I) -> Result<GitOutput, WorkspaceError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let joined = args
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    debug!(cwd = %cwd.display(), "git {}", joined);

    let output = Command::new("git")
        .args(&args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true)
        .output()
        .await
        .map_err(WorkspaceError::Spawn)?;

    Ok(GitOutput {
        args: joined,
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run `git <args>` in `cwd` and fail on a non-zero exit.
pub(super) async fn run_checked<I, S>(cwd: &Path, args: I) -> Result<String, WorkspaceError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run(cwd, args).await?.checked()
}

/// Whether the tree has changes. Ignored files never count; untracked files
/// count only when `include_untracked` is set.
pub(super) fn has_changes(repo: &Repository, include_untracked: bool) -> Result<bool, git2::Error> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(include_untracked)
        .recurse_untracked_dirs(include_untracked)
        .include_ignored(false)
        .exclude_submodules(true);

    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses.iter().any(|entry| {
        let status = entry.status();
        !(status.is_empty() || status.contains(Status::IGNORED))
            && (include_untracked || !status.contains(Status::WT_NEW))
    }))
}

/// HEAD commit, or `None` on an unborn branch.
pub(super) fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
    repo.head().ok().and_then(|head| head.peel_to_commit().ok())
}

/// Short name of the checked-out branch, `None` when HEAD is detached or unborn.
pub(super) fn current_branch(repo: &Repository) -> Option<String> {
    let head = repo.head().ok()?;
    if !head.is_branch() {
        return None;
    }
    head.shorthand().map(str::to_string)
}

pub(super) fn local_branch_tip(repo: &Repository, name: &str) -> Result<Option<Oid>, git2::Error> {
    match repo.find_branch(name, BranchType::Local) {
        Ok(branch) => Ok(Some(branch.get().peel_to_commit()?.id())),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// True when `ancestor` is reachable from `descendant` (or equal to it).
pub(super) fn is_ancestor(
    repo: &Repository,
    ancestor: Oid,
    descendant: Oid,
) -> Result<bool, git2::Error> {
    if ancestor == descendant {
        return Ok(true);
    }
    repo.graph_descendant_of(descendant, ancestor)
}

/// Stage every change (including deletions) and commit on HEAD.
///
/// Returns `None` when the staged tree equals the parent tree.
pub(super) fn commit_all(repo: &Repository, message: &str) -> Result<Option<Oid>, git2::Error> {
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let parent = head_commit(repo);
    if let Some(parent) = &parent
        && parent.tree_id() == tree_id
    {
        return Ok(None);
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = repo
        .signature()
        .or_else(|_| Signature::now("baton", "baton@localhost"))?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(Some(oid))
}

/// Diff between two commits, bucketed by change kind with line counts.
pub(super) fn diff_summary(
    repo: &Repository,
    base: Oid,
    tip: Oid,
) -> Result<FileChangeSummary, git2::Error> {
    let base_tree = repo.find_commit(base)?.tree()?;
    let tip_tree = repo.find_commit(tip)?.tree()?;

    let mut opts = DiffOptions::new();
    let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&tip_tree), Some(&mut opts))?;

    let mut summary = FileChangeSummary::default();
    let mut lines_added = 0;
    let mut lines_removed = 0;

    diff.foreach(
        &mut |delta, _progress| {
            match delta.status() {
                Delta::Added | Delta::Copied => {
                    if let Some(path) = delta.new_file().path() {
                        summary.files_added.push(path.to_path_buf());
                    }
                }
                Delta::Modified | Delta::Renamed | Delta::Typechange => {
                    if let Some(path) = delta.new_file().path() {
                        summary.files_modified.push(path.to_path_buf());
                    }
                }
                Delta::Deleted => {
                    if let Some(path) = delta.old_file().path() {
                        summary.files_deleted.push(path.to_path_buf());
                    }
                }
                _ => {}
            }
            true
        },
        None,
        None,
        Some(&mut |_delta, _hunk, line| {
            match line.origin() {
                '+' => lines_added += 1,
                '-' => lines_removed += 1,
                _ => {}
            }
            true
        }),
    )?;

    summary.total_lines_added = lines_added;
    summary.total_lines_removed = lines_removed;
    Ok(summary)
}

/// Exclusive advisory lock held for the duration of a merge.
///
/// Lives in the git common dir so every worktree of the repository contends
/// on the same file. Released when dropped.
pub(super) struct MergeLock {
    _file: File,
}

impl MergeLock {
    pub const FILE_NAME: &'static str = "baton-merge.lock";

    /// Blocks until the lock is held.
    pub fn acquire(path: &Path) -> Result<Self, WorkspaceError> {
        use fs2::FileExt;

        let lock_err = |source| WorkspaceError::Lock {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(lock_err)?;
        file.lock_exclusive().map_err(lock_err)?;
        debug!(path = %path.display(), "acquired merge lock");
        Ok(Self { _file: file })
    }

    pub fn path_for(repo: &Repository) -> PathBuf {
        repo.commondir().join(Self::FILE_NAME)
    }
}
