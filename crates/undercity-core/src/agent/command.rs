//! Subprocess-backed [`AgentRunner`].
//!
//! Spawns a configurable agent command (default `claude -p --model
//! <tier>`), writes the prompt to its stdin, and returns stdout as the
//! agent's text. The command template substitutes `{model}` with the tier
//! name. Credentials and any richer transport configuration are the agent
//! command's own business.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use super::{AgentError, AgentRequest, AgentResult, AgentRunner};

/// Environment variable overriding the agent command line.
pub const AGENT_CMD_ENV: &str = "UNDERCITY_AGENT_CMD";

/// Rough token estimate for transports that do not report usage: four
/// bytes per token.
fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Default agent runner: shells out to an agent CLI.
#[derive(Debug, Clone)]
pub struct CommandAgentRunner {
    program: String,
    args: Vec<String>,
}

impl CommandAgentRunner {
    /// Runner for the default `claude` CLI in non-interactive mode.
    pub fn new() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["-p".into(), "--model".into(), "{model}".into()],
        }
    }

    /// Runner from a full command line, e.g. `"claude -p --model {model}"`.
    /// Whitespace-split; the `{model}` placeholder is replaced per request.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_owned);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Resolve from [`AGENT_CMD_ENV`] if set, otherwise the default.
    pub fn from_env() -> Self {
        std::env::var(AGENT_CMD_ENV)
            .ok()
            .as_deref()
            .and_then(Self::from_command_line)
            .unwrap_or_default()
    }
}

impl Default for CommandAgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRunner for CommandAgentRunner {
    async fn run(&self, request: AgentRequest) -> Result<AgentResult, AgentError> {
        let start = Instant::now();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{model}", request.tier.as_str()))
            .collect();

        tracing::debug!(
            task_id = %request.task_id,
            program = %self.program,
            tier = %request.tier,
            "spawning agent"
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentError::Spawn)?;

        // Write the prompt and close stdin so the agent starts processing.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(AgentError::Spawn)?;
            drop(stdin);
        }

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

        // Resolve the wait first; the select must not hold a borrow of
        // `child` into its handler arms, so killing happens after.
        let waited = {
            let wait_all = async {
                let (status, stdout, stderr) =
                    tokio::join!(child.wait(), read_stdout, read_stderr);
                (status, stdout, stderr)
            };
            tokio::select! {
                _ = request.cancel.cancelled() => None,
                result = tokio::time::timeout(request.timeout, wait_all) => Some(result),
            }
        };

        match waited {
            None => {
                terminate(&mut child).await;
                Err(AgentError::Cancelled)
            }
            Some(Err(_elapsed)) => {
                terminate(&mut child).await;
                Err(AgentError::TimedOut(request.timeout))
            }
            Some(Ok((Err(e), _, _))) => Err(AgentError::Spawn(e)),
            Some(Ok((Ok(status), stdout, stderr))) => {
                if !status.success() {
                    if looks_rate_limited(&stderr) || looks_rate_limited(&stdout) {
                        return Err(AgentError::RateLimited(
                            first_line(&stderr).unwrap_or("rate limit").to_owned(),
                        ));
                    }
                    return Err(AgentError::Failed {
                        code: status.code(),
                        stderr: stderr.chars().take(2048).collect(),
                    });
                }
                Ok(AgentResult {
                    input_tokens: estimate_tokens(&request.prompt),
                    output_tokens: estimate_tokens(&stdout),
                    text: stdout,
                    duration: start.elapsed(),
                })
            }
        }
    }
}

/// SIGTERM first, brief grace, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: sending a signal to a pid we own; no memory is touched.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(std::time::Duration::from_secs(2), child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    let _ = child.kill().await;
}

fn looks_rate_limited(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("429")
        || lower.contains("overloaded")
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().find(|l| !l.trim().is_empty())
}
