//! Verification runner: executes a project's detected verification
//! commands (typecheck, test, lint, build) in a working directory and
//! returns a structured per-category report.
//!
//! The report feeds the worker's fix loop, the merge pipeline's
//! post-rebase gate, and the emergency-mode mainline health check.

pub mod presets;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use undercity_state::models::VerifyKind;

pub use presets::{commands_for_project_type, detect_project_type, VerifyCommand};

/// Default wall-clock cap per verification command.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(300);

/// Result of one verification command.
#[derive(Debug, Clone)]
pub struct VerifyCheck {
    pub kind: VerifyKind,
    pub passed: bool,
    /// Exit code, or `None` if the process was killed (timeout/signal).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Structured report across all categories that ran.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub checks: Vec<VerifyCheck>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// The first failing check, in execution order.
    pub fn first_failure(&self) -> Option<&VerifyCheck> {
        self.checks.iter().find(|c| !c.passed)
    }

    /// Category of the first failure, if any.
    pub fn failure_kind(&self) -> Option<VerifyKind> {
        self.first_failure().map(|c| c.kind)
    }

    /// Compact human/agent-readable summary of every failure, truncated
    /// per check so a chatty test runner cannot blow up a fix prompt.
    pub fn failure_summary(&self, max_bytes_per_check: usize) -> String {
        let mut out = String::new();
        for check in self.checks.iter().filter(|c| !c.passed) {
            out.push_str(&format!(
                "== {} failed (exit {:?})\n",
                check.kind, check.exit_code
            ));
            let detail = if check.stderr.trim().is_empty() {
                &check.stdout
            } else {
                &check.stderr
            };
            out.push_str(&truncate_snippet(detail, max_bytes_per_check));
            out.push('\n');
        }
        out
    }
}

/// Runs a fixed set of verification commands in a directory.
#[derive(Debug, Clone)]
pub struct VerifyRunner {
    commands: Vec<VerifyCommand>,
    timeout: Duration,
}

impl VerifyRunner {
    /// Runner with the preset commands detected for `project_dir`. A
    /// project with no recognized type gets an empty suite, which always
    /// passes: there is nothing to check.
    pub fn detect(project_dir: &Path) -> Self {
        let commands = detect_project_type(project_dir)
            .map(|t| commands_for_project_type(&t))
            .unwrap_or_default();
        Self {
            commands,
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    /// Runner with an explicit command list (tests, custom projects).
    pub fn with_commands(commands: Vec<VerifyCommand>) -> Self {
        Self {
            commands,
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run every command in order, collecting a report. Commands after a
    /// failure still run: the worker wants the full picture for its fix
    /// prompt.
    pub async fn run(&self, dir: &Path) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for command in &self.commands {
            let check = self.run_one(command, dir).await?;
            tracing::debug!(
                kind = %check.kind,
                passed = check.passed,
                duration_ms = check.duration_ms,
                "verification command finished"
            );
            report.checks.push(check);
        }
        Ok(report)
    }

    async fn run_one(&self, command: &VerifyCommand, dir: &Path) -> Result<VerifyCheck> {
        let start = Instant::now();

        let mut child = Command::new(&command.command)
            .args(&command.args)
            .current_dir(dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to execute {} check (command: {} {})",
                    command.kind,
                    command.command,
                    command.args.join(" "),
                )
            })?;

        // Read pipes concurrently with waiting so a chatty child cannot
        // deadlock on a full pipe buffer.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        match tokio::time::timeout(self.timeout, async {
            let (wait, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
            (wait, stdout, stderr)
        })
        .await
        {
            Ok((Ok(status), stdout, stderr)) => Ok(VerifyCheck {
                kind: command.kind,
                passed: status.success(),
                exit_code: status.code(),
                stdout,
                stderr,
                duration_ms: start.elapsed().as_millis() as u64,
            }),
            Ok((Err(e), _, _)) => Err(e).with_context(|| {
                format!("failed to wait on {} check", command.kind)
            }),
            Err(_) => {
                let _ = child.kill().await;
                Ok(VerifyCheck {
                    kind: command.kind,
                    passed: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!(
                        "{} check timed out after {}s",
                        command.kind,
                        self.timeout.as_secs()
                    ),
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }
}

/// Truncate a string to at most `max_bytes` bytes on a char boundary,
/// appending "..." if truncated.
pub fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(kind: VerifyKind, command: &str, args: &[&str]) -> VerifyCommand {
        VerifyCommand {
            project_type: "test".into(),
            kind,
            command: command.into(),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[tokio::test]
    async fn empty_suite_passes() {
        let runner = VerifyRunner::with_commands(vec![]);
        let report = runner.run(Path::new("/tmp")).await.unwrap();
        assert!(report.passed());
        assert!(report.first_failure().is_none());
    }

    #[tokio::test]
    async fn passing_and_failing_checks() {
        let runner = VerifyRunner::with_commands(vec![
            cmd(VerifyKind::Typecheck, "true", &[]),
            cmd(VerifyKind::Test, "false", &[]),
            cmd(VerifyKind::Lint, "true", &[]),
        ]);
        let report = runner.run(Path::new("/tmp")).await.unwrap();
        assert!(!report.passed());
        assert_eq!(report.failure_kind(), Some(VerifyKind::Test));
        // Later checks still ran.
        assert_eq!(report.checks.len(), 3);
        assert!(report.checks[2].passed);
    }

    #[tokio::test]
    async fn captures_output_in_summary() {
        let runner = VerifyRunner::with_commands(vec![cmd(
            VerifyKind::Test,
            "sh",
            &["-c", "echo broken assertion >&2; exit 1"],
        )]);
        let report = runner.run(Path::new("/tmp")).await.unwrap();
        let summary = report.failure_summary(1024);
        assert!(summary.contains("test failed"));
        assert!(summary.contains("broken assertion"));
    }

    #[tokio::test]
    async fn timeout_fails_the_check() {
        let runner = VerifyRunner::with_commands(vec![cmd(VerifyKind::Build, "sleep", &["30"])])
            .with_timeout(Duration::from_millis(200));
        let report = runner.run(Path::new("/tmp")).await.unwrap();
        assert!(!report.passed());
        let failure = report.first_failure().unwrap();
        assert_eq!(failure.exit_code, None);
        assert!(failure.stderr.contains("timed out"));
    }

    #[test]
    fn truncate_on_boundary() {
        assert_eq!(truncate_snippet("hello", 10), "hello");
        assert_eq!(truncate_snippet("abcdefghij", 5), "abcde...");
    }
}
