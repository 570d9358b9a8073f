//! The `AgentRunner` trait -- the opaque language-model transport.
//!
//! The engine never generates code itself; it hands a prompt, a model
//! tier, and a working directory to an [`AgentRunner`] and gets back the
//! agent's final text plus usage accounting. The trait is object-safe so
//! the orchestrator can hold `Arc<dyn AgentRunner>` and tests can swap in
//! scripted fakes.

pub mod command;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use undercity_state::models::ModelTier;

pub use command::CommandAgentRunner;

/// A single agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Task on whose behalf the agent runs (for logging and accounting).
    pub task_id: Uuid,
    /// The full prompt, including any briefing and handoff context.
    pub prompt: String,
    /// Model tier to invoke.
    pub tier: ModelTier,
    /// Working directory (the task's worktree, or the main checkout for
    /// meta-tasks).
    pub cwd: PathBuf,
    /// Wall-clock cap for the invocation.
    pub timeout: Duration,
    /// Cooperative cancellation (drain, health-monitor kill).
    pub cancel: CancellationToken,
}

/// What came back from an agent invocation.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// The agent's final text output.
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration: Duration,
}

/// Errors from an agent invocation. `RateLimited` is distinguished so the
/// rate-limit tracker can record the hit and pause the grid.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent rate-limited: {0}")]
    RateLimited(String),

    #[error("agent timed out after {0:?}")]
    TimedOut(Duration),

    #[error("agent was cancelled")]
    Cancelled,

    #[error("failed to spawn agent: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("agent exited with {code:?}: {stderr}")]
    Failed {
        code: Option<i32>,
        stderr: String,
    },
}

/// Opaque transport for one agent invocation.
///
/// Implementations must kill any child process they spawned when the
/// request's cancellation token fires or the timeout elapses.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentResult, AgentError>;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentRunner) {}
};
