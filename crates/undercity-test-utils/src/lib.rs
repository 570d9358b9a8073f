//! Shared test fixtures: temporary git repositories and scriptable agent
//! runners. Used by the core and CLI test suites.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use async_trait::async_trait;

use undercity_core::agent::{AgentError, AgentRequest, AgentResult, AgentRunner};

/// A temporary git repository with an initial commit on `main`.
pub struct TempRepo {
    // Held for its Drop.
    _dir: tempfile::TempDir,
    pub path: PathBuf,
}

impl TempRepo {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let path = dir.path().to_path_buf();

        run_git(&path, &["init", "-b", "main"]);
        run_git(&path, &["config", "user.email", "test@undercity.dev"]);
        run_git(&path, &["config", "user.name", "Undercity Test"]);
        std::fs::write(path.join("README.md"), "# Test repo\n").expect("failed to write README");
        run_git(&path, &["add", "."]);
        run_git(&path, &["commit", "-m", "Initial commit"]);

        Self { _dir: dir, path }
    }

    /// Write a file and commit it on the current branch.
    pub fn commit_file(&self, rel_path: &str, contents: &str, message: &str) {
        let file = self.path.join(rel_path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dir");
        }
        std::fs::write(&file, contents).expect("failed to write file");
        run_git(&self.path, &["add", "."]);
        run_git(&self.path, &["commit", "-m", message]);
    }

    pub fn head_sha(&self) -> String {
        output_git(&self.path, &["rev-parse", "HEAD"])
    }

    /// Number of commits on the current branch.
    pub fn commit_count(&self) -> usize {
        output_git(&self.path, &["rev-list", "--count", "HEAD"])
            .parse()
            .expect("rev-list count not a number")
    }

    pub fn file_exists(&self, rel_path: &str) -> bool {
        self.path.join(rel_path).exists()
    }
}

impl Default for TempRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Run git in `dir`, panicking on failure (fixtures must not half-exist).
pub fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Run git in `dir` and return trimmed stdout.
pub fn output_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(output.status.success());
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

// ---------------------------------------------------------------------------
// Scripted agent
// ---------------------------------------------------------------------------

type Effect = Box<dyn Fn(&Path) + Send + Sync>;

/// One scripted reply. Optionally runs an effect in the request's working
/// directory first (standing in for the agent's own edits).
pub struct ScriptedResponse {
    text: String,
    effect: Option<Effect>,
    error: Option<fn() -> AgentError>,
}

impl ScriptedResponse {
    /// Reply with text, no side effects.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            effect: None,
            error: None,
        }
    }

    /// Reply with text after mutating the working directory.
    pub fn with_effect(
        text: impl Into<String>,
        effect: impl Fn(&Path) + Send + Sync + 'static,
    ) -> Self {
        Self {
            text: text.into(),
            effect: Some(Box::new(effect)),
            error: None,
        }
    }

    /// Fail the invocation with the given error.
    pub fn error(make: fn() -> AgentError) -> Self {
        Self {
            text: String::new(),
            effect: None,
            error: Some(make),
        }
    }
}

/// An [`AgentRunner`] that replays a fixed script of responses in order.
///
/// When the script runs out, further requests repeat the final response
/// (a worker may legitimately call the agent more times than a test cares
/// to enumerate, e.g. review passes).
pub struct ScriptedAgent {
    responses: Mutex<Vec<ScriptedResponse>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: an agent that always answers `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self::new(vec![ScriptedResponse::text(text)])
    }

    /// Prompts received so far (for assertions).
    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentResult, AgentError> {
        self.calls.lock().unwrap().push(request.prompt.clone());

        let mut responses = self.responses.lock().unwrap();
        let response = if responses.len() > 1 {
            responses.remove(0)
        } else if let Some(last) = responses.first() {
            // Replay the final response without consuming it.
            if let Some(make_error) = last.error {
                return Err(make_error());
            }
            if let Some(effect) = &last.effect {
                effect(&request.cwd);
            }
            return Ok(AgentResult {
                text: last.text.clone(),
                input_tokens: (request.prompt.len() / 4) as u64,
                output_tokens: (last.text.len() / 4).max(1) as u64,
                duration: std::time::Duration::from_millis(1),
            });
        } else {
            return Err(AgentError::Failed {
                code: None,
                stderr: "scripted agent has no responses".into(),
            });
        };

        if let Some(make_error) = response.error {
            return Err(make_error());
        }
        if let Some(effect) = &response.effect {
            effect(&request.cwd);
        }
        Ok(AgentResult {
            text: response.text.clone(),
            input_tokens: (request.prompt.len() / 4) as u64,
            output_tokens: (response.text.len() / 4).max(1) as u64,
            duration: std::time::Duration::from_millis(1),
        })
    }
}

/// An agent that computes each response from the request (full control
/// for orchestration tests).
pub struct FnAgent<F>(pub F);

#[async_trait]
impl<F> AgentRunner for FnAgent<F>
where
    F: Fn(&AgentRequest) -> Result<AgentResult, AgentError> + Send + Sync,
{
    async fn run(&self, request: AgentRequest) -> Result<AgentResult, AgentError> {
        (self.0)(&request)
    }
}
