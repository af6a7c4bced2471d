use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::baton_config::BatonConfig;
use crate::checkpoint::CheckpointStore;
use crate::gates::{CommandGate, ResiliencePolicy};
use crate::handoff::AgentBridge;
use crate::task::TaskId;
use crate::workspace::{WorkspaceConfig, WorkspaceManager};

pub const STATE_DIR_NAME: &str = ".baton";

/// Runtime configuration for baton.
///
/// Resolves the state directory layout under the repository root and hands
/// each component the explicit configuration it needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub handoff_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub settings: BatonConfig,
}

impl Config {
    /// Resolve configuration for `project_dir`.
    ///
    /// When `project_dir` sits inside a git repository, the repository's
    /// working directory becomes the project root.
    pub fn new(project_dir: PathBuf, verbose: bool, base_branch: Option<String>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let project_dir = discover_repo_root(&project_dir).unwrap_or(project_dir);

        let state_dir = project_dir.join(STATE_DIR_NAME);
        let settings = BatonConfig::load(&state_dir, base_branch)
            .context("Failed to load baton configuration")?;

        Ok(Self::with_settings(project_dir, verbose, settings))
    }

    /// Build from already-resolved settings. `project_dir` is used as given.
    pub fn with_settings(project_dir: PathBuf, verbose: bool, settings: BatonConfig) -> Self {
        let state_dir = project_dir.join(STATE_DIR_NAME);
        Self {
            checkpoints_dir: state_dir.join("checkpoints"),
            handoff_dir: state_dir.join("handoff"),
            workspaces_dir: state_dir.join("workspaces"),
            worktrees_dir: state_dir.join("worktrees"),
            log_dir: state_dir.join("logs"),
            state_dir,
            project_dir,
            verbose,
            settings,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.state_dir,
            &self.checkpoints_dir,
            &self.handoff_dir,
            &self.workspaces_dir,
            &self.worktrees_dir,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn workspace_config(&self) -> WorkspaceConfig {
        WorkspaceConfig {
            repo_root: self.project_dir.clone(),
            worktrees_dir: self.worktrees_dir.clone(),
            registry_dir: self.workspaces_dir.clone(),
            base_branch: self.settings.base_branch(),
            branch_prefix: self.settings.branch_prefix().to_string(),
        }
    }

    pub fn workspace_manager(&self) -> WorkspaceManager {
        WorkspaceManager::new(self.workspace_config())
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(self.checkpoints_dir.clone())
    }

    pub fn agent_bridge(&self, task_id: &TaskId) -> AgentBridge {
        AgentBridge::new(&self.handoff_dir, task_id)
    }

    /// Quality gate for a workspace, or `None` when no verify command is set.
    pub fn command_gate(&self, working_dir: &Path) -> Option<CommandGate> {
        self.settings
            .verify_cmd()
            .map(|verify| CommandGate::new(verify, self.settings.fix_cmd(), working_dir))
    }

    pub fn resilience_policy(&self) -> ResiliencePolicy {
        self.settings.resilience_policy()
    }

    pub fn merge_on_success(&self) -> bool {
        self.settings.merge_on_success()
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("baton.log")
    }
}

fn discover_repo_root(dir: &Path) -> Option<PathBuf> {
    let repo = git2::Repository::discover(dir).ok()?;
    let workdir = repo.workdir()?;
    workdir.canonicalize().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baton_config::{BatonToml, EnvOverrides};
    use crate::workspace::test_support::init_repo;
    use std::fs;
    use tempfile::tempdir;

    fn settings(toml: BatonToml) -> BatonConfig {
        BatonConfig::new(toml, EnvOverrides::default(), None)
    }

    #[test]
    fn test_directory_layout() {
        let dir = tempdir().unwrap();
        let config = Config::with_settings(dir.path().to_path_buf(), false, settings(BatonToml::default()));

        assert_eq!(config.state_dir, dir.path().join(".baton"));
        assert_eq!(config.checkpoints_dir, dir.path().join(".baton/checkpoints"));
        assert_eq!(config.handoff_dir, dir.path().join(".baton/handoff"));
        assert_eq!(config.workspaces_dir, dir.path().join(".baton/workspaces"));
        assert_eq!(config.worktrees_dir, dir.path().join(".baton/worktrees"));
        assert_eq!(config.log_file(), dir.path().join(".baton/logs/baton.log"));

        config.ensure_directories().unwrap();
        assert!(config.checkpoints_dir.is_dir());
        assert!(config.log_dir.is_dir());
    }

    #[test]
    fn test_new_resolves_repo_root_from_subdirectory() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let sub = dir.path().join("src/nested");
        fs::create_dir_all(&sub).unwrap();

        let config = Config::new(sub, false, None).unwrap();
        assert_eq!(config.project_dir, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_new_reads_baton_toml() {
        let dir = tempdir().unwrap();
        let state = dir.path().join(".baton");
        fs::create_dir_all(&state).unwrap();
        fs::write(
            state.join("baton.toml"),
            "[workspace]\nbranch_prefix = \"jobs\"\n[integration]\nmerge_on_success = false\n",
        )
        .unwrap();

        let config = Config::new(dir.path().to_path_buf(), true, Some("trunk".into())).unwrap();
        let ws = config.workspace_config();
        assert_eq!(ws.branch_prefix, "jobs");
        assert_eq!(ws.base_branch.as_deref(), Some("trunk"));
        assert!(!config.merge_on_success());
        assert!(config.verbose);
    }

    #[test]
    fn test_new_fails_for_missing_directory() {
        let dir = tempdir().unwrap();
        assert!(Config::new(dir.path().join("nope"), false, None).is_err());
    }

    #[test]
    fn test_command_gate_requires_verify() {
        let dir = tempdir().unwrap();
        let config = Config::with_settings(dir.path().to_path_buf(), false, settings(BatonToml::default()));
        assert!(config.command_gate(dir.path()).is_none());

        let mut toml = BatonToml::default();
        toml.quality_gates.verify = Some("make test".into());
        toml.quality_gates.fix = Some("make fix".into());
        let config = Config::with_settings(dir.path().to_path_buf(), false, settings(toml));
        let gate = config.command_gate(dir.path()).unwrap();
        assert_eq!(gate.verify, "make test");
        assert_eq!(gate.fix.as_deref(), Some("make fix"));
    }
}
