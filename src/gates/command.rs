//! Shell-command quality gate.
//!
//! - Verify: run the command with `sh -c`; exit 0 passes, combined output is the details
//! - Fix: run the command with the failure details on stdin; exit 0 means a fix was
//!   applied, and each non-empty stdout line is reported as a changed file
//! - A failed fix is classified from its stderr
//! - Each command runs in its own process group, killed when the command is
//!   dropped or finishes, so nothing it started outlives the attempt

use super::{ErrorClass, FixReport, QualityGate, Verification};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

/// Keep at most this many bytes of command output.
const MAX_DETAILS_BYTES: usize = 16 * 1024;

// Checked in order; unrecoverable classes first.
static CLASS_PATTERNS: LazyLock<Vec<(ErrorClass, Regex)>> = LazyLock::new(|| {
    [
        (
            ErrorClass::Permission,
            r"(?i)permission denied|operation not permitted|\bEACCES\b|\bEPERM\b",
        ),
        (
            ErrorClass::Dependency,
            r"(?i)could not resolve|failed to resolve|unresolved import|no matching package|cannot find module|modulenotfounderror|package .+ not found|crate .+ not found",
        ),
        (
            ErrorClass::Environment,
            r"(?i)command not found|no such file or directory|\bENOENT\b|not installed|no space left|out of memory",
        ),
        (ErrorClass::Syntax, r"(?i)syntax ?error|unexpected token|parse error"),
        (ErrorClass::Type, r"(?i)type ?error|mismatched types"),
        (ErrorClass::Lint, r"(?i)\blint\b|clippy|eslint|flake8"),
        (
            ErrorClass::Test,
            r"(?i)tests? failed|assertion|panicked|\bFAILED\b",
        ),
    ]
    .into_iter()
    .map(|(class, pattern)| (class, Regex::new(pattern).unwrap()))
    .collect()
});

impl ErrorClass {
    /// Classify failure output by the first matching pattern.
    pub fn infer(output: &str) -> ErrorClass {
        CLASS_PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(output))
            .map(|(class, _)| *class)
            .unwrap_or(ErrorClass::Unknown)
    }
}

/// Verify and fix steps backed by shell commands run in the workspace.
#[derive(Debug, Clone)]
pub struct CommandGate {
    pub verify: String,
    pub fix: Option<String>,
    pub working_dir: PathBuf,
}

impl CommandGate {
    pub fn new(verify: impl Into<String>, fix: Option<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            verify: verify.into(),
            fix,
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }

    fn shell(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// Sends SIGKILL to a command's process group on drop.
///
/// `kill_on_drop` only reaches the `sh` process; this also reaches whatever
/// it started.
struct ProcessGroupGuard {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()),
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.filter(|pgid| *pgid > 0) {
            // SAFETY: plain syscall on a group this gate created; ESRCH once
            // the group is gone is expected and ignored.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}

#[async_trait]
impl QualityGate for CommandGate {
    async fn verify(&self) -> Verification {
        debug!(command = %self.verify, "Running verify command");
        let output = match self.shell(&self.verify).stdin(Stdio::null()).spawn() {
            Ok(child) => {
                let _group = ProcessGroupGuard::new(&child);
                child.wait_with_output().await
            }
            Err(e) => Err(e),
        };
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return Verification::failed(format!(
                    "failed to run verify command '{}': {}",
                    self.verify, e
                ));
            }
        };

        let mut details = String::from_utf8_lossy(&output.stdout).into_owned();
        details.push_str(&String::from_utf8_lossy(&output.stderr));
        Verification {
            passed: output.status.success(),
            details: truncate_tail(&details, MAX_DETAILS_BYTES),
        }
    }

    async fn fix(&self, details: String) -> FixReport {
        let Some(command) = &self.fix else {
            return FixReport::failed(ErrorClass::Unknown, "no fix command configured");
        };
        debug!(command = %command, "Running fix command");

        let mut child = match self.shell(command).stdin(Stdio::piped()).spawn() {
            Ok(child) => child,
            Err(e) => {
                return FixReport::failed(
                    ErrorClass::Environment,
                    format!("failed to spawn fix command '{}': {}", command, e),
                );
            }
        };

        let _group = ProcessGroupGuard::new(&child);

        if let Some(mut stdin) = child.stdin.take() {
            // A fix command that ignores stdin may close it early.
            let _ = stdin.write_all(details.as_bytes()).await;
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                return FixReport::failed(
                    ErrorClass::Environment,
                    format!("failed to wait for fix command: {}", e),
                );
            }
        };

        if output.status.success() {
            let changes = String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            return FixReport::applied(changes);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let class = ErrorClass::infer(&stderr);
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        FixReport::failed(class, truncate_tail(&message, MAX_DETAILS_BYTES))
    }
}

/// Keep the last `max` bytes, cut on a char boundary.
fn truncate_tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{LoopOutcome, ResiliencePolicy, run_with_resilience};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_infer_error_class() {
        assert_eq!(ErrorClass::infer("bash: cargo: command not found"), ErrorClass::Environment);
        assert_eq!(ErrorClass::infer("EACCES: permission denied, open"), ErrorClass::Permission);
        assert_eq!(
            ErrorClass::infer("ModuleNotFoundError: No module named 'x'"),
            ErrorClass::Dependency
        );
        assert_eq!(ErrorClass::infer("SyntaxError: invalid syntax"), ErrorClass::Syntax);
        assert_eq!(ErrorClass::infer("error[E0308]: mismatched types"), ErrorClass::Type);
        assert_eq!(ErrorClass::infer("test result: FAILED. 1 passed; 2 failed"), ErrorClass::Test);
        assert_eq!(ErrorClass::infer("something odd"), ErrorClass::Unknown);
    }

    #[test]
    fn test_truncate_tail_keeps_end() {
        let text = "a".repeat(10) + "END";
        let cut = truncate_tail(&text, 5);
        assert!(cut.ends_with("aaEND"));
        assert!(cut.starts_with("..."));
        assert_eq!(truncate_tail("short", 100), "short");
    }

    #[tokio::test]
    async fn test_verify_reports_exit_status_and_output() {
        let dir = tempdir().unwrap();
        let pass = CommandGate::new("echo ok", None, dir.path()).verify().await;
        assert!(pass.passed);
        assert!(pass.details.contains("ok"));

        let fail = CommandGate::new("echo broken >&2; exit 3", None, dir.path())
            .verify()
            .await;
        assert!(!fail.passed);
        assert!(fail.details.contains("broken"));
    }

    #[tokio::test]
    async fn test_fix_receives_details_on_stdin() {
        let dir = tempdir().unwrap();
        let gate = CommandGate::new(
            "true",
            Some("cat > received.txt && echo received.txt".into()),
            dir.path(),
        );
        let report = gate.fix("failing test: foo".into()).await;

        assert!(report.fixed);
        assert_eq!(report.changes, vec!["received.txt"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("received.txt")).unwrap(),
            "failing test: foo"
        );
    }

    #[tokio::test]
    async fn test_fix_failure_is_classified() {
        let dir = tempdir().unwrap();
        let gate = CommandGate::new(
            "true",
            Some("echo 'sh: rustfmt: command not found' >&2; exit 127".into()),
            dir.path(),
        );
        let report = gate.fix(String::new()).await;

        assert!(!report.fixed);
        assert_eq!(report.error_class, Some(ErrorClass::Environment));
        assert!(report.error.unwrap().contains("command not found"));
    }

    #[tokio::test]
    async fn test_missing_fix_command_fails_recoverably() {
        let dir = tempdir().unwrap();
        let report = CommandGate::new("true", None, dir.path())
            .fix(String::new())
            .await;
        assert!(!report.fixed);
        assert_eq!(report.error_class, Some(ErrorClass::Unknown));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_fix_stops_its_children() {
        let dir = tempdir().unwrap();
        let gate = CommandGate::new(
            "exit 1",
            Some("cat >/dev/null; (sleep 1; touch late.marker); true".into()),
            dir.path(),
        );

        let report = run_with_resilience(
            || gate.verify(),
            |details| gate.fix(details),
            ResiliencePolicy {
                max_attempts: 1,
                attempt_timeout: Duration::from_millis(200),
            },
        )
        .await;
        assert_eq!(report.outcome, LoopOutcome::TimedOut);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late.marker").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verify_stops_background_jobs() {
        let dir = tempdir().unwrap();
        let gate = CommandGate::new(
            "(sleep 1; touch late.marker) >/dev/null 2>&1 & echo started",
            None,
            dir.path(),
        );
        let result = gate.verify().await;
        assert!(result.passed);
        assert!(result.details.contains("started"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late.marker").exists());
    }

    #[tokio::test]
    async fn test_command_gate_drives_resilience_loop() {
        let dir = tempdir().unwrap();
        // Verify passes once the fix has created the marker file.
        let gate = CommandGate::new(
            "test -f fixed.marker || { echo 'assertion failed'; exit 1; }",
            Some("touch fixed.marker && echo fixed.marker".into()),
            dir.path(),
        );

        let report = run_with_resilience(
            || gate.verify(),
            |details| gate.fix(details),
            ResiliencePolicy {
                max_attempts: 3,
                attempt_timeout: Duration::from_secs(10),
            },
        )
        .await;

        assert_eq!(report.outcome, LoopOutcome::Fixed);
        assert_eq!(report.attempt_count(), 1);
    }
}
