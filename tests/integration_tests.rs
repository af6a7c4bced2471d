//! Integration tests for the baton CLI.
//!
//! These drive the binary end to end: argument parsing, exit statuses and the
//! files left under `.baton/`.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use git2::{Repository, RepositoryInitOptions, Signature};
use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a baton Command
fn baton() -> Command {
    cargo_bin_cmd!("baton")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Initialize a git repository on `main` with one commit.
fn init_git_project(dir: &TempDir) {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(dir.path(), &opts).unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
    }
    fs::write(dir.path().join("README.md"), "# project\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
}

fn handoff_dir(dir: &TempDir, task_id: &str) -> std::path::PathBuf {
    dir.path().join(".baton/handoff").join(task_id)
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_baton_help() {
        baton()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("workspace"));
    }

    #[test]
    fn test_baton_version() {
        baton()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("baton"));
    }

    #[test]
    fn test_status_without_tasks() {
        let dir = create_temp_project();
        baton()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No tasks with checkpoints"));
    }

    #[test]
    fn test_workspace_list_empty() {
        let dir = create_temp_project();
        baton()
            .current_dir(dir.path())
            .args(["workspace", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No workspaces"));
    }

    #[test]
    fn test_invalid_task_id_is_rejected() {
        let dir = create_temp_project();
        baton()
            .current_dir(dir.path())
            .args(["run", "../escape"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Invalid task id"));
    }

    #[test]
    fn test_description_flags_conflict() {
        baton()
            .args([
                "run",
                "T1",
                "--description",
                "inline",
                "--description-file",
                "desc.md",
            ])
            .assert()
            .failure();
    }
}

// =============================================================================
// Task lifecycle
// =============================================================================

mod task_lifecycle {
    use super::*;

    #[test]
    fn test_reset_is_idempotent() {
        let dir = create_temp_project();
        for _ in 0..2 {
            baton()
                .current_dir(dir.path())
                .args(["reset", "T1"])
                .assert()
                .success()
                .stdout(predicate::str::contains("No checkpoint for task T1"));
        }
    }

    #[test]
    fn test_cancel_unknown_task_fails() {
        let dir = create_temp_project();
        baton()
            .current_dir(dir.path())
            .args(["cancel", "T1"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("cannot resume"));
    }

    #[test]
    fn test_run_outside_repository_fails() {
        let dir = create_temp_project();
        baton()
            .current_dir(dir.path())
            .args(["run", "T1", "--title", "Outside"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("failed in phase 1"));

        baton()
            .current_dir(dir.path())
            .args(["status", "T1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"));
    }

    #[test]
    fn test_run_requests_plan_and_exits_42() {
        let dir = create_temp_project();
        init_git_project(&dir);

        baton()
            .current_dir(dir.path())
            .args(["run", "T1", "--title", "Add feature"])
            .assert()
            .code(42)
            .stdout(predicate::str::contains("waiting on agent"));

        let request_path = handoff_dir(&dir, "T1").join(".agent-request-phase2.json");
        let request: Value = serde_json::from_str(&fs::read_to_string(&request_path).unwrap()).unwrap();
        assert_eq!(request["phase"], 2);
        assert_eq!(request["payload"]["kind"], "plan");
        assert_eq!(request["payload"]["task"]["title"], "Add feature");

        assert!(dir.path().join(".baton/checkpoints/T1.json").exists());
        assert!(dir.path().join(".baton/worktrees/T1").exists());
        assert!(dir.path().join(".baton/logs/baton.log").exists());

        // No response yet: still waiting, same exit status.
        baton()
            .current_dir(dir.path())
            .args(["run", "T1"])
            .assert()
            .code(42);

        baton()
            .current_dir(dir.path())
            .args(["status", "T1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("awaiting-agent"))
            .stdout(predicate::str::contains("Pending"));
    }

    #[test]
    fn test_agent_response_advances_to_next_request() {
        let dir = create_temp_project();
        init_git_project(&dir);

        baton()
            .current_dir(dir.path())
            .args(["run", "T1"])
            .assert()
            .code(42);

        let handoff = handoff_dir(&dir, "T1");
        let request: Value = serde_json::from_str(
            &fs::read_to_string(handoff.join(".agent-request-phase2.json")).unwrap(),
        )
        .unwrap();
        let response = json!({
            "phase": 2,
            "success": true,
            "request_id": request["request_id"],
            "payload": { "summary": "plan", "steps": ["write code"] },
        });
        fs::write(
            handoff.join(".agent-response-phase2.json"),
            response.to_string(),
        )
        .unwrap();

        baton()
            .current_dir(dir.path())
            .args(["run", "T1"])
            .assert()
            .code(42);

        assert!(!handoff.join(".agent-request-phase2.json").exists());
        let request: Value = serde_json::from_str(
            &fs::read_to_string(handoff.join(".agent-request-phase3.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(request["payload"]["kind"], "implement");
        assert_eq!(request["payload"]["plan"]["steps"][0], "write code");
    }

    #[test]
    fn test_cancel_then_reset_force() {
        let dir = create_temp_project();
        init_git_project(&dir);

        baton()
            .current_dir(dir.path())
            .args(["run", "T1"])
            .assert()
            .code(42);

        baton()
            .current_dir(dir.path())
            .args(["cancel", "T1", "--reason", "wrong task"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Workspace kept"));

        baton()
            .current_dir(dir.path())
            .args(["run", "T1"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("reset it before running again"));

        baton()
            .current_dir(dir.path())
            .args(["workspace", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("preserved: cancelled: wrong task"));

        baton()
            .current_dir(dir.path())
            .args(["reset", "T1", "--force"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed checkpoint"))
            .stdout(predicate::str::contains("Removed workspace"));

        assert!(!dir.path().join(".baton/worktrees/T1").exists());
    }
}
