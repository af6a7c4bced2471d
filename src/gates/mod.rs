//! Quality-gate resilience loop.
//!
//! Verification runs first; while it fails, a fix step is attempted under a
//! per-attempt timeout, up to a fixed number of attempts. The loop stops early
//! when a fix times out or reports an error class automated repair cannot
//! handle. Every outcome other than passing carries guidance for a human.

mod command;

pub use command::CommandGate;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Verify/fix collaborator driven by [`run_with_resilience`].
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn verify(&self) -> Verification;

    /// Attempt a repair given the latest verification details.
    async fn fix(&self, details: String) -> FixReport;
}

/// Upper bound for a single fix attempt, in seconds.
pub const MAX_ITERATION_SECONDS: u64 = 60;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Result of one verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub passed: bool,
    /// Output describing the failures; handed to the next fix attempt.
    pub details: String,
}

impl Verification {
    pub fn passed() -> Self {
        Self {
            passed: true,
            details: String::new(),
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

/// Category of a failed fix, used to decide whether retrying can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Syntax,
    Type,
    Test,
    Lint,
    Environment,
    Dependency,
    Permission,
    Unknown,
}

impl ErrorClass {
    /// Environment, dependency and permission problems need a human.
    pub fn is_recoverable(self) -> bool {
        !matches!(
            self,
            ErrorClass::Environment | ErrorClass::Dependency | ErrorClass::Permission
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Syntax => "syntax",
            ErrorClass::Type => "type",
            ErrorClass::Test => "test",
            ErrorClass::Lint => "lint",
            ErrorClass::Environment => "environment",
            ErrorClass::Dependency => "dependency",
            ErrorClass::Permission => "permission",
            ErrorClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// What a fix step reports back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixReport {
    pub fixed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub changes: Vec<String>,
}

impl FixReport {
    pub fn applied(changes: Vec<String>) -> Self {
        Self {
            fixed: true,
            changes,
            ..Default::default()
        }
    }

    pub fn failed(class: ErrorClass, error: impl Into<String>) -> Self {
        Self {
            fixed: false,
            error_class: Some(class),
            error: Some(error.into()),
            changes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    /// Fix ran; whether it worked is decided by the next verification.
    Applied,
    TimedOut,
    /// Fix reported an error.
    Failed,
}

/// One fix attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub index: u32,
    pub duration_secs: f64,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

impl RetryAttempt {
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs)
    }

    fn is_unrecoverable(&self) -> bool {
        self.outcome == AttemptOutcome::Failed
            && self.error_class.is_some_and(|class| !class.is_recoverable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopOutcome {
    /// Verification passed before any fix was needed.
    Passed,
    Fixed,
    TimedOut,
    Exhausted,
    Unrecoverable,
}

impl LoopOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, LoopOutcome::Passed | LoopOutcome::Fixed)
    }
}

impl fmt::Display for LoopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopOutcome::Passed => "passed",
            LoopOutcome::Fixed => "fixed",
            LoopOutcome::TimedOut => "timed-out",
            LoopOutcome::Exhausted => "exhausted",
            LoopOutcome::Unrecoverable => "unrecoverable",
        };
        f.write_str(s)
    }
}

/// Stable machine-readable code for a loop outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationCode {
    AutoFixSucceeded,
    IterationTimeout,
    FixGenerationFailed,
    MaxAttemptsExceeded,
}

impl fmt::Display for RecommendationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecommendationCode::AutoFixSucceeded => "AUTO_FIX_SUCCEEDED",
            RecommendationCode::IterationTimeout => "ITERATION_TIMEOUT",
            RecommendationCode::FixGenerationFailed => "FIX_GENERATION_FAILED",
            RecommendationCode::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResiliencePolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: Duration::from_secs(MAX_ITERATION_SECONDS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceReport {
    pub outcome: LoopOutcome,
    pub attempts: Vec<RetryAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    /// Details of the last failing verification, empty once passing.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_failure: String,
}

impl ResilienceReport {
    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn code(&self) -> RecommendationCode {
        match self.outcome {
            LoopOutcome::Passed | LoopOutcome::Fixed => RecommendationCode::AutoFixSucceeded,
            LoopOutcome::TimedOut => RecommendationCode::IterationTimeout,
            LoopOutcome::Unrecoverable => RecommendationCode::FixGenerationFailed,
            LoopOutcome::Exhausted => RecommendationCode::MaxAttemptsExceeded,
        }
    }
}

/// Run one fix attempt, abandoning it once `timeout` elapses.
///
/// The fix future is dropped on timeout. Gates that spawn processes must stop
/// them on drop; `CommandGate` kills the whole process group.
pub async fn attempt_fix_with_timeout<F>(index: u32, fix: F, timeout: Duration) -> RetryAttempt
where
    F: Future<Output = FixReport>,
{
    let started = Instant::now();
    match tokio::time::timeout(timeout, fix).await {
        Ok(report) => {
            let duration_secs = started.elapsed().as_secs_f64();
            let outcome = if report.fixed {
                AttemptOutcome::Applied
            } else {
                AttemptOutcome::Failed
            };
            RetryAttempt {
                index,
                duration_secs,
                outcome,
                changes: report.changes,
                error: report.error,
                error_class: report.error_class,
            }
        }
        Err(_) => {
            warn!(attempt = index, timeout_secs = timeout.as_secs_f64(), "Fix attempt timed out");
            RetryAttempt {
                index,
                duration_secs: started.elapsed().as_secs_f64(),
                outcome: AttemptOutcome::TimedOut,
                changes: Vec::new(),
                error: Some(format!(
                    "exceeded the {:.1}s iteration timeout",
                    timeout.as_secs_f64()
                )),
                error_class: None,
            }
        }
    }
}

/// Verify, then alternate fix and re-verify until passing or out of budget.
pub async fn run_with_resilience<V, VF, X, XF>(
    mut verify: V,
    mut fix: X,
    policy: ResiliencePolicy,
) -> ResilienceReport
where
    V: FnMut() -> VF,
    VF: Future<Output = Verification>,
    X: FnMut(String) -> XF,
    XF: Future<Output = FixReport>,
{
    let initial = verify().await;
    if initial.passed {
        info!("Quality gates already passing");
        return ResilienceReport {
            outcome: LoopOutcome::Passed,
            attempts: Vec::new(),
            guidance: None,
            last_failure: String::new(),
        };
    }

    let mut details = initial.details;
    let mut attempts = Vec::new();

    for index in 1..=policy.max_attempts {
        info!(attempt = index, max = policy.max_attempts, "Running fix attempt");
        let attempt = attempt_fix_with_timeout(index, fix(details.clone()), policy.attempt_timeout).await;

        if attempt.outcome == AttemptOutcome::TimedOut {
            let guidance = timeout_guidance(&attempt, policy.attempt_timeout);
            attempts.push(attempt);
            return ResilienceReport {
                outcome: LoopOutcome::TimedOut,
                attempts,
                guidance: Some(guidance),
                last_failure: details,
            };
        }

        if attempt.is_unrecoverable() {
            let guidance = unrecoverable_guidance(&attempt);
            attempts.push(attempt);
            return ResilienceReport {
                outcome: LoopOutcome::Unrecoverable,
                attempts,
                guidance: Some(guidance),
                last_failure: details,
            };
        }

        attempts.push(attempt);

        let check = verify().await;
        if check.passed {
            info!(attempts = index, "Quality gates passing after fix");
            return ResilienceReport {
                outcome: LoopOutcome::Fixed,
                guidance: Some(format!(
                    "Quality gates passing after {} fix attempt(s).",
                    index
                )),
                attempts,
                last_failure: String::new(),
            };
        }
        details = check.details;
    }

    warn!(attempts = attempts.len(), "Fix attempts exhausted");
    ResilienceReport {
        outcome: LoopOutcome::Exhausted,
        guidance: Some(exhausted_guidance(attempts.len(), &details)),
        attempts,
        last_failure: details,
    }
}

fn timeout_guidance(attempt: &RetryAttempt, timeout: Duration) -> String {
    format!(
        "Fix attempt {} hit the {:.0}s iteration timeout and was abandoned.\n\
         Recommended: review the failures manually; they may be too large for automated repair.",
        attempt.index,
        timeout.as_secs_f64()
    )
}

fn unrecoverable_guidance(attempt: &RetryAttempt) -> String {
    let class = attempt
        .error_class
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let error = attempt.error.as_deref().unwrap_or("no error output");
    format!(
        "Fix attempt {} failed with a {} error that automated repair cannot resolve:\n{}\n\
         Review the environment (toolchain, dependencies, permissions) and re-run the task.",
        attempt.index, class, error
    )
}

fn exhausted_guidance(attempts: usize, details: &str) -> String {
    let mut guidance = if attempts == 0 {
        "Verification failed and no fix attempts were allowed; fix attempts exhausted before starting.\n\
         Recommended: configure a fix command or fix the failures manually."
            .to_string()
    } else {
        format!(
            "All {} fix attempts exhausted without passing quality gates.\n\
             Recommended: review the remaining failures and fix them manually.",
            attempts
        )
    };
    let tail = tail_lines(details, 20);
    if !tail.is_empty() {
        guidance.push_str("\n\nLast failure output:\n");
        guidance.push_str(&tail);
    }
    guidance
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Multi-line, human-readable summary of a report.
pub fn format_guidance(report: &ResilienceReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Quality Gate Result: {}\n", report.code()));
    out.push_str(&format!("  Outcome: {}\n", report.outcome));
    out.push_str(&format!(
        "  Success: {}\n",
        if report.success() { "Yes" } else { "No" }
    ));
    out.push_str(&format!("  Attempts: {}\n", report.attempt_count()));

    if !report.attempts.is_empty() {
        out.push_str("\nFix Attempt Summary:\n");
        for attempt in &report.attempts {
            let outcome = match attempt.outcome {
                AttemptOutcome::Applied => "applied",
                AttemptOutcome::TimedOut => "timed out",
                AttemptOutcome::Failed => "failed",
            };
            out.push_str(&format!(
                "  Attempt {}: {} ({:.1}s, {} file(s))",
                attempt.index,
                outcome,
                attempt.duration_secs,
                attempt.changes.len()
            ));
            if let Some(error) = &attempt.error {
                out.push_str(&format!(" - {}", error.lines().next().unwrap_or_default()));
            }
            out.push('\n');
        }
    }

    if let Some(guidance) = &report.guidance {
        out.push_str("\nGuidance:\n");
        for line in guidance.lines() {
            out.push_str(&format!("  {}\n", line));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quick_policy(max_attempts: u32) -> ResiliencePolicy {
        ResiliencePolicy {
            max_attempts,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_constants() {
        assert_eq!(MAX_ITERATION_SECONDS, 60);
        assert_eq!(DEFAULT_MAX_ATTEMPTS, 3);
        let policy = ResiliencePolicy::default();
        assert_eq!(policy.attempt_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_already_passing_makes_no_attempts() {
        let fixes = Cell::new(0);
        let report = run_with_resilience(
            || async { Verification::passed() },
            |_| {
                fixes.set(fixes.get() + 1);
                async { FixReport::applied(vec![]) }
            },
            quick_policy(3),
        )
        .await;

        assert_eq!(report.outcome, LoopOutcome::Passed);
        assert_eq!(report.attempt_count(), 0);
        assert_eq!(report.code(), RecommendationCode::AutoFixSucceeded);
        assert_eq!(fixes.get(), 0);
    }

    #[tokio::test]
    async fn test_fixed_on_second_attempt() {
        let verifies = Cell::new(0);
        let report = run_with_resilience(
            || {
                verifies.set(verifies.get() + 1);
                let n = verifies.get();
                async move {
                    if n >= 3 {
                        Verification::passed()
                    } else {
                        Verification::failed(format!("failure #{}", n))
                    }
                }
            },
            |details| async move { FixReport::applied(vec![format!("fix for {}", details)]) },
            quick_policy(3),
        )
        .await;

        assert!(report.success());
        assert_eq!(report.outcome, LoopOutcome::Fixed);
        assert_eq!(report.attempt_count(), 2);
        assert_eq!(report.attempts[1].changes, vec!["fix for failure #2"]);
        assert!(report.guidance.unwrap().contains("2 fix attempt"));
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let report = run_with_resilience(
            || async { Verification::failed("still failing") },
            |_| async { FixReport::applied(vec!["partial.rs".into()]) },
            quick_policy(3),
        )
        .await;

        assert!(!report.success());
        assert_eq!(report.attempt_count(), 3);
        assert_eq!(report.code(), RecommendationCode::MaxAttemptsExceeded);
        let guidance = report.guidance.unwrap();
        assert!(guidance.to_lowercase().contains("exhausted"));
        assert!(guidance.contains("Recommended") || guidance.contains("Review"));
        assert!(guidance.contains("still failing"));
    }

    #[tokio::test]
    async fn test_custom_max_attempts_is_honoured() {
        let report = run_with_resilience(
            || async { Verification::failed("x") },
            |_| async { FixReport::applied(vec![]) },
            quick_policy(5),
        )
        .await;
        assert_eq!(report.attempt_count(), 5);
    }

    #[tokio::test]
    async fn test_zero_attempts_exhausts_immediately() {
        let report = run_with_resilience(
            || async { Verification::failed("broken") },
            |_| async { FixReport::applied(vec![]) },
            quick_policy(0),
        )
        .await;
        assert_eq!(report.outcome, LoopOutcome::Exhausted);
        assert_eq!(report.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_stops_loop_without_reverifying() {
        let verifies = Cell::new(0);
        let report = run_with_resilience(
            || {
                verifies.set(verifies.get() + 1);
                async { Verification::failed("complex error") }
            },
            |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                FixReport::applied(vec!["slow.rs".into()])
            },
            ResiliencePolicy {
                max_attempts: 3,
                attempt_timeout: Duration::from_millis(50),
            },
        )
        .await;

        assert_eq!(report.outcome, LoopOutcome::TimedOut);
        assert_eq!(report.code(), RecommendationCode::IterationTimeout);
        assert_eq!(report.attempt_count(), 1);
        assert_eq!(report.attempts[0].outcome, AttemptOutcome::TimedOut);
        assert!(report.guidance.unwrap().to_lowercase().contains("timeout"));
        assert_eq!(verifies.get(), 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_stops_loop() {
        let verifies = Cell::new(0);
        let report = run_with_resilience(
            || {
                verifies.set(verifies.get() + 1);
                async { Verification::failed("error[E0432]: unresolved import") }
            },
            |_| async { FixReport::failed(ErrorClass::Dependency, "crate `foo` not found") },
            quick_policy(3),
        )
        .await;

        assert_eq!(report.outcome, LoopOutcome::Unrecoverable);
        assert_eq!(report.code(), RecommendationCode::FixGenerationFailed);
        assert_eq!(report.attempt_count(), 1);
        assert!(report.guidance.unwrap().contains("crate `foo` not found"));
        assert_eq!(verifies.get(), 1);
    }

    #[tokio::test]
    async fn test_recoverable_fix_failure_keeps_retrying() {
        let report = run_with_resilience(
            || async { Verification::failed("assertion failed") },
            |_| async { FixReport::failed(ErrorClass::Test, "could not patch test") },
            quick_policy(2),
        )
        .await;

        assert_eq!(report.outcome, LoopOutcome::Exhausted);
        assert_eq!(report.attempt_count(), 2);
        assert!(
            report
                .attempts
                .iter()
                .all(|a| a.outcome == AttemptOutcome::Failed)
        );
    }

    #[tokio::test]
    async fn test_attempt_fix_with_timeout_records_duration() {
        let attempt = attempt_fix_with_timeout(
            1,
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                FixReport::applied(vec!["config.rs".into()])
            },
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(attempt.outcome, AttemptOutcome::Applied);
        assert!(attempt.duration_secs >= 0.05);
        assert!(attempt.duration_secs < 5.0);
        assert_eq!(attempt.changes, vec!["config.rs"]);
    }

    #[test]
    fn test_format_guidance_success() {
        let report = ResilienceReport {
            outcome: LoopOutcome::Fixed,
            attempts: vec![RetryAttempt {
                index: 1,
                duration_secs: 5.5,
                outcome: AttemptOutcome::Applied,
                changes: vec!["a.rs".into(), "b.rs".into()],
                error: None,
                error_class: None,
            }],
            guidance: Some("All gates passing.".into()),
            last_failure: String::new(),
        };
        let output = format_guidance(&report);

        assert!(output.contains("AUTO_FIX_SUCCEEDED"));
        assert!(output.contains("Success: Yes"));
        assert!(output.contains("Attempts: 1"));
        assert!(output.contains("Fix Attempt Summary:"));
        assert!(output.contains("5.5s"));
        assert!(output.contains("2 file(s)"));
    }

    #[test]
    fn test_format_guidance_failure_multiline() {
        let report = ResilienceReport {
            outcome: LoopOutcome::Exhausted,
            attempts: vec![],
            guidance: Some("Line 1\nLine 2\nattempts exhausted".into()),
            last_failure: "x".into(),
        };
        let output = format_guidance(&report);

        assert!(output.contains("MAX_ATTEMPTS_EXCEEDED"));
        assert!(output.contains("Success: No"));
        assert!(output.contains("Line 1") && output.contains("Line 2"));
        assert!(output.contains("exhausted"));
    }

    #[test]
    fn test_format_guidance_without_guidance_has_no_section() {
        let report = ResilienceReport {
            outcome: LoopOutcome::Passed,
            attempts: vec![],
            guidance: None,
            last_failure: String::new(),
        };
        let output = format_guidance(&report);
        assert!(output.contains("AUTO_FIX_SUCCEEDED"));
        assert_eq!(output.matches("Guidance:").count(), 0);
    }

    #[test]
    fn test_error_class_recoverability() {
        assert!(ErrorClass::Test.is_recoverable());
        assert!(ErrorClass::Unknown.is_recoverable());
        assert!(!ErrorClass::Permission.is_recoverable());
        assert!(!ErrorClass::Environment.is_recoverable());
    }

    #[test]
    fn test_report_serializes_codes_kebab_case() {
        let report = ResilienceReport {
            outcome: LoopOutcome::TimedOut,
            attempts: vec![],
            guidance: None,
            last_failure: String::new(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "timed-out");
        assert_eq!(
            serde_json::to_value(RecommendationCode::IterationTimeout).unwrap(),
            "ITERATION_TIMEOUT"
        );
    }
}
