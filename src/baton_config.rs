//! Project configuration read from `.baton/baton.toml`.
//!
//! Layering: file -> environment -> CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [workspace]
//! base_branch = "main"
//! branch_prefix = "baton"
//!
//! [quality_gates]
//! verify = "cargo test"
//! fix = "./scripts/autofix.sh"
//! max_attempts = 3
//! attempt_timeout_secs = 60
//!
//! [integration]
//! merge_on_success = true
//! ```
//!
//! Environment overrides: `BATON_BASE_BRANCH`, `BATON_VERIFY_CMD`, `BATON_FIX_CMD`.

use crate::gates::{DEFAULT_MAX_ATTEMPTS, MAX_ITERATION_SECONDS, ResiliencePolicy};
use crate::workspace::DEFAULT_BRANCH_PREFIX;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "baton.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSection {
    /// Branch tasks fork from and merge into. Defaults to the checked-out branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_branch_prefix() -> String {
    DEFAULT_BRANCH_PREFIX.to_string()
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            base_branch: None,
            branch_prefix: default_branch_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityGatesSection {
    /// Verification command; quality gates are skipped when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    /// Fix command, fed the verification output on stdin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_attempt_timeout_secs() -> u64 {
    MAX_ITERATION_SECONDS
}

impl Default for QualityGatesSection {
    fn default() -> Self {
        Self {
            verify: None,
            fix: None,
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrationSection {
    /// Merge the task branch into the base branch when the task completes.
    #[serde(default = "default_merge_on_success")]
    pub merge_on_success: bool,
}

fn default_merge_on_success() -> bool {
    true
}

impl Default for IntegrationSection {
    fn default() -> Self {
        Self {
            merge_on_success: default_merge_on_success(),
        }
    }
}

/// The complete baton.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BatonToml {
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub quality_gates: QualityGatesSection,
    #[serde(default)]
    pub integration: IntegrationSection,
}

impl BatonToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse baton.toml")
    }

    /// Load `<baton_dir>/baton.toml`, or defaults when it does not exist.
    pub fn load_or_default(baton_dir: &Path) -> Result<Self> {
        let path = baton_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize baton.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Problems that would make the configuration unusable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let prefix = &self.workspace.branch_prefix;
        if prefix.is_empty() || prefix.starts_with('-') || prefix.contains(char::is_whitespace) {
            problems.push(format!("workspace.branch_prefix '{}' is not a valid branch prefix", prefix));
        }
        if self.quality_gates.attempt_timeout_secs == 0 {
            problems.push("quality_gates.attempt_timeout_secs must be greater than 0".to_string());
        }
        if self.quality_gates.fix.is_some() && self.quality_gates.verify.is_none() {
            problems.push("quality_gates.fix is set but quality_gates.verify is not".to_string());
        }
        problems
    }
}

/// Values taken from the process environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub base_branch: Option<String>,
    pub verify_cmd: Option<String>,
    pub fix_cmd: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            base_branch: non_empty("BATON_BASE_BRANCH"),
            verify_cmd: non_empty("BATON_VERIFY_CMD"),
            fix_cmd: non_empty("BATON_FIX_CMD"),
        }
    }
}

/// Layered settings: file, then environment, then CLI flags.
#[derive(Debug, Clone, PartialEq)]
pub struct BatonConfig {
    pub toml: BatonToml,
    pub env: EnvOverrides,
    /// CLI override for the base branch.
    pub cli_base_branch: Option<String>,
}

impl BatonConfig {
    pub fn new(toml: BatonToml, env: EnvOverrides, cli_base_branch: Option<String>) -> Self {
        Self {
            toml,
            env,
            cli_base_branch,
        }
    }

    /// Load the file under `baton_dir` and the process environment.
    pub fn load(baton_dir: &Path, cli_base_branch: Option<String>) -> Result<Self> {
        let toml = BatonToml::load_or_default(baton_dir)?;
        Ok(Self::new(toml, EnvOverrides::from_env(), cli_base_branch))
    }

    /// Base branch (CLI -> env -> file). `None` means "the checked-out branch".
    pub fn base_branch(&self) -> Option<String> {
        self.cli_base_branch
            .clone()
            .or_else(|| self.env.base_branch.clone())
            .or_else(|| self.toml.workspace.base_branch.clone())
    }

    pub fn branch_prefix(&self) -> &str {
        &self.toml.workspace.branch_prefix
    }

    /// Verify command (env -> file).
    pub fn verify_cmd(&self) -> Option<String> {
        self.env
            .verify_cmd
            .clone()
            .or_else(|| self.toml.quality_gates.verify.clone())
    }

    /// Fix command (env -> file).
    pub fn fix_cmd(&self) -> Option<String> {
        self.env
            .fix_cmd
            .clone()
            .or_else(|| self.toml.quality_gates.fix.clone())
    }

    /// Retry policy; no fix command means no fix attempts.
    pub fn resilience_policy(&self) -> ResiliencePolicy {
        let max_attempts = if self.fix_cmd().is_some() {
            self.toml.quality_gates.max_attempts
        } else {
            0
        };
        ResiliencePolicy {
            max_attempts,
            attempt_timeout: Duration::from_secs(self.toml.quality_gates.attempt_timeout_secs),
        }
    }

    pub fn merge_on_success(&self) -> bool {
        self.toml.integration.merge_on_success
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
