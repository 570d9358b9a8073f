use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Blocked,
    Decomposed,
}

impl TaskStatus {
    /// Whether this status is terminal (the task will never run again
    /// without an explicit operator action).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Decomposed)
    }

    /// Check whether a transition from `self` to `to` is a valid edge in
    /// the task lifecycle graph.
    ///
    /// ```text
    /// pending     -> in_progress | blocked | decomposed
    /// in_progress -> complete | failed | blocked
    /// failed      -> pending   (retry)
    /// blocked     -> pending   (unblock)
    /// ```
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        if self == to {
            // Idempotent re-assertion (e.g. resuming a crashed in_progress
            // task) is allowed.
            return true;
        }
        matches!(
            (self, to),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Blocked)
                | (Self::Pending, Self::Decomposed)
                | (Self::InProgress, Self::Complete)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Blocked)
                | (Self::Failed, Self::Pending)
                | (Self::Failed, Self::Complete)
                | (Self::Blocked, Self::Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Decomposed => "decomposed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            "decomposed" => Ok(Self::Decomposed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Model capability tier. Ordered: `Haiku < Sonnet < Opus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelTier {
    /// The next tier up, or `None` at the top of the ladder.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Haiku => Some(Self::Sonnet),
            Self::Sonnet => Some(Self::Opus),
            Self::Opus => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Haiku => "haiku",
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = ModelTierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "haiku" => Ok(Self::Haiku),
            "sonnet" => Ok(Self::Sonnet),
            "opus" => Ok(Self::Opus),
            other => Err(ModelTierParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ModelTier`] string.
#[derive(Debug, Clone)]
pub struct ModelTierParseError(pub String);

impl fmt::Display for ModelTierParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid model tier: {:?}", self.0)
    }
}

impl std::error::Error for ModelTierParseError {}

// ---------------------------------------------------------------------------

/// Phase of the worker state machine, as recorded in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Plan,
    Execute,
    Verify,
    Fix,
    Review,
    Escalate,
    Done,
}

impl WorkerPhase {
    /// Phases during which a silent worker counts as stuck. Planning and
    /// escalation are short; `Done` is terminal.
    pub fn is_stuck_eligible(self) -> bool {
        matches!(self, Self::Execute | Self::Verify | Self::Review | Self::Fix)
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Fix => "fix",
            Self::Review => "review",
            Self::Escalate => "escalate",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Category of verification command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyKind {
    Typecheck,
    Test,
    Lint,
    Build,
}

impl fmt::Display for VerifyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Typecheck => "typecheck",
            Self::Test => "test",
            Self::Lint => "lint",
            Self::Build => "build",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Terminal error category for a task attempt.
///
/// Serialized kebab-case to match the on-disk record and event-log format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "category", content = "detail")]
pub enum ErrorCategory {
    Planning,
    DecompositionRequested,
    AlreadyComplete,
    VerifyFailed(VerifyKind),
    RebaseConflict,
    FfFailed,
    WorktreeCreateFailed,
    Stuck,
    RateLimited,
    BudgetExceeded,
    EmergencyMode,
    TierCapExhausted,
    WorkerCrashed,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => f.write_str("planning"),
            Self::DecompositionRequested => f.write_str("decomposition-requested"),
            Self::AlreadyComplete => f.write_str("already-complete"),
            Self::VerifyFailed(kind) => write!(f, "verify-failed:{kind}"),
            Self::RebaseConflict => f.write_str("rebase-conflict"),
            Self::FfFailed => f.write_str("ff-failed"),
            Self::WorktreeCreateFailed => f.write_str("worktree-create-failed"),
            Self::Stuck => f.write_str("stuck"),
            Self::RateLimited => f.write_str("rate-limited"),
            Self::BudgetExceeded => f.write_str("budget-exceeded"),
            Self::EmergencyMode => f.write_str("emergency-mode"),
            Self::TierCapExhausted => f.write_str("tier-cap-exhausted"),
            Self::WorkerCrashed => f.write_str("worker-crashed"),
            Self::Internal => f.write_str("internal"),
        }
    }
}

// ---------------------------------------------------------------------------
// Task and its nested records
// ---------------------------------------------------------------------------

/// Structured task description attached by a human or planner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub test_plan: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Context carried across attempts: what earlier workers learned, and any
/// guidance a human supplied for the retry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffContext {
    #[serde(default)]
    pub prior_attempt_summary: Option<String>,
    #[serde(default)]
    pub human_guidance: Option<String>,
    #[serde(default)]
    pub retry: bool,
}

/// Record of the most recent attempt on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastAttempt {
    pub model: ModelTier,
    #[serde(default)]
    pub error: Option<String>,
    pub attempt_count: u32,
}

/// A unit of engineering work on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub objective: String,
    pub status: TaskStatus,
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub subtask_ids: Vec<Uuid>,
    #[serde(default)]
    pub is_decomposed: bool,
    #[serde(default)]
    pub estimated_files: Option<Vec<String>>,
    #[serde(default)]
    pub ticket: Option<Ticket>,
    #[serde(default)]
    pub handoff: Option<HandoffContext>,
    #[serde(default)]
    pub last_attempt: Option<LastAttempt>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    /// Create a fresh pending task.
    pub fn new(objective: impl Into<String>, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            objective: objective.into(),
            status: TaskStatus::Pending,
            priority,
            tags: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            parent_id: None,
            subtask_ids: Vec::new(),
            is_decomposed: false,
            estimated_files: None,
            ticket: None,
            handoff: None,
            last_attempt: None,
            last_error: None,
        }
    }

    /// Whether the objective marks this as a meta-task (`[meta:<type>]`
    /// prefix). Meta-tasks run in the main checkout and return board
    /// recommendations instead of code.
    pub fn meta_type(&self) -> Option<&str> {
        let rest = self.objective.trim_start().strip_prefix("[meta:")?;
        let end = rest.find(']')?;
        Some(&rest[..end])
    }
}

// ---------------------------------------------------------------------------
// Recovery records
// ---------------------------------------------------------------------------

/// In-flight record written under `active/<taskId>.json` before a worker
/// spawns and removed when it reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTaskState {
    pub task_id: Uuid,
    pub batch_id: Uuid,
    pub objective: String,
    pub status: TaskStatus,
    pub branch: String,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    pub model: ModelTier,
    pub started_at: DateTime<Utc>,
}

/// Terminal record written under `completed/<taskId>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTaskState {
    pub task_id: Uuid,
    pub batch_id: Uuid,
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<ErrorCategory>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub modified_files: Vec<String>,
    #[serde(default)]
    pub merged_sha: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Batch-level metadata under `batch/<batchId>.json`. A batch is "active"
/// iff any `active/*` file exists; this record only describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub batch_id: Uuid,
    pub task_ids: Vec<Uuid>,
    pub max_concurrent: usize,
    pub starting_model: ModelTier,
    pub started_at: DateTime<Utc>,
}

/// Durable per-task progress record written by the worker at each phase
/// boundary. Read by the health monitor (staleness) and by recovery
/// (resume context). Single-writer: only the owning worker writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: Uuid,
    pub phase: WorkerPhase,
    pub tier: ModelTier,
    /// Total attempts across all tiers.
    pub attempt: u32,
    /// Fix attempts at the current tier.
    pub tier_attempt: u32,
    pub last_step: String,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub resume_context: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Assignment record written into each worktree as
/// `.undercity-assignment.json` so workers, the health monitor, and
/// post-crash inspection agree on the worktree's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub objective: String,
    pub model: ModelTier,
    pub branch: String,
    pub max_attempts: u32,
    #[serde(default)]
    pub push_on_success: bool,
    #[serde(default)]
    pub review_passes: bool,
}
