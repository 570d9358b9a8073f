//! The worker state machine: one task, driven from plan to terminal.
//!
//! Phases: plan -> execute -> verify -> (fix | review | escalate) ->
//! terminal. Verification failures burn tier-local fix attempts; when
//! those run out the worker escalates the model tier (haiku -> sonnet ->
//! opus, opus gated by the session budget) and re-executes with the
//! failure folded into its context. A checkpoint is written at every
//! phase boundary; the health monitor watches nothing else.
//!
//! The worker never touches the task board. Its terminal state is a
//! [`WorkerReport`] the orchestrator ingests.

pub mod briefing;
pub mod prompts;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use undercity_state::models::{Checkpoint, ErrorCategory, ModelTier, Task, VerifyKind, WorkerPhase};
use undercity_state::recovery::RecoveryStore;

use crate::agent::{AgentError, AgentRequest, AgentResult, AgentRunner};
use crate::git;
use crate::orchestrator::budget::OpusBudget;
use crate::verify::VerifyRunner;
use briefing::Briefing;

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub starting_tier: ModelTier,
    /// Escalation never exceeds this tier.
    pub max_tier: ModelTier,
    /// Fix attempts per tier before escalating.
    pub max_retries_per_tier: u32,
    /// Total execute/fix invocations across all tiers.
    pub max_attempts: u32,
    /// Whether to run critique passes after a green verify.
    pub review_passes: bool,
    pub max_review_passes_per_tier: u32,
    pub max_opus_review_passes: u32,
    /// Wall-clock cap per agent invocation.
    pub agent_timeout: Duration,
    /// Commit successful work in the worktree on completion.
    pub auto_commit: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            starting_tier: ModelTier::Sonnet,
            max_tier: ModelTier::Opus,
            max_retries_per_tier: 2,
            max_attempts: 8,
            review_passes: true,
            max_review_passes_per_tier: 1,
            max_opus_review_passes: 2,
            agent_timeout: Duration::from_secs(1800),
            auto_commit: true,
        }
    }
}

/// Terminal outcome of a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Complete {
        /// The objective was already satisfied; nothing changed.
        zero_change: bool,
    },
    /// The planner refused: the task needs decomposition into these
    /// subtask objectives.
    Decompose { subtask_objectives: Vec<String> },
    Failed {
        category: ErrorCategory,
        message: String,
    },
}

/// Everything the orchestrator needs from a finished worker.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub task_id: Uuid,
    pub outcome: WorkerOutcome,
    /// Tier the worker ended on.
    pub tier: ModelTier,
    pub attempts: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub modified_files: Vec<String>,
    /// Files touched that a sibling subtask had claimed. Recorded, not
    /// enforced.
    pub scope_violations: Vec<String>,
    pub escalated_to_opus: bool,
}

/// A worker wired up and ready to run.
pub struct Worker {
    pub task: Task,
    pub briefing: Briefing,
    pub worktree_path: PathBuf,
    pub base_sha: String,
    pub config: WorkerConfig,
    pub runner: Arc<dyn AgentRunner>,
    pub store: RecoveryStore,
    pub verify: VerifyRunner,
    pub cancel: CancellationToken,
    pub nudges: tokio::sync::mpsc::Receiver<String>,
    pub opus_budget: Arc<Mutex<OpusBudget>>,
}

enum Recovery {
    /// Burn one tier-local fix attempt.
    Fix,
    /// Moved up a tier; re-execute.
    Escalated(ModelTier),
    Fatal(ErrorCategory, String),
}

struct Progress {
    tier: ModelTier,
    attempt: u32,
    tier_fix: u32,
    review_done: u32,
    input_tokens: u64,
    output_tokens: u64,
    escalated_to_opus: bool,
    last_error: Option<String>,
    plan: Option<String>,
    hints: Vec<String>,
}

impl Worker {
    /// Drive the task to a terminal state.
    pub async fn run(mut self) -> WorkerReport {
        let started = Instant::now();
        let mut p = Progress {
            tier: self.config.starting_tier.min(self.config.max_tier),
            attempt: 0,
            tier_fix: 0,
            review_done: 0,
            input_tokens: 0,
            output_tokens: 0,
            escalated_to_opus: false,
            last_error: None,
            plan: None,
            hints: Vec::new(),
        };

        tracing::info!(
            task_id = %self.task.id,
            tier = %p.tier,
            objective = %self.task.objective,
            "worker starting"
        );

        let outcome = self.drive(&mut p).await;

        let modified_files = self.modified_files();
        let scope_violations = self.scope_violations(&modified_files);
        if !scope_violations.is_empty() {
            tracing::warn!(
                task_id = %self.task.id,
                files = ?scope_violations,
                "worker touched files claimed by sibling tasks"
            );
        }

        let report = WorkerReport {
            task_id: self.task.id,
            outcome,
            tier: p.tier,
            attempts: p.attempt,
            input_tokens: p.input_tokens,
            output_tokens: p.output_tokens,
            duration_ms: started.elapsed().as_millis() as u64,
            modified_files,
            scope_violations,
            escalated_to_opus: p.escalated_to_opus,
        };
        tracing::info!(
            task_id = %self.task.id,
            outcome = ?report.outcome,
            attempts = report.attempts,
            tier = %report.tier,
            "worker finished"
        );
        report
    }

    async fn drive(&mut self, p: &mut Progress) -> WorkerOutcome {
        // ---- plan ---------------------------------------------------------
        let plan = loop {
            self.drain_nudges(p);
            self.write_checkpoint(p, WorkerPhase::Plan, "planning");
            let prompt = prompts::plan_prompt(&self.task, &self.briefing);
            match self.invoke(&prompt, p).await {
                Ok(result) => {
                    let text = result.text;
                    if text.contains(prompts::NEEDS_DECOMPOSITION) {
                        let subtask_objectives = prompts::parse_decomposition(&text);
                        if subtask_objectives.is_empty() {
                            return WorkerOutcome::Failed {
                                category: ErrorCategory::Planning,
                                message: "decomposition requested without subtasks".into(),
                            };
                        }
                        self.write_checkpoint(p, WorkerPhase::Done, "decomposition requested");
                        return WorkerOutcome::Decompose { subtask_objectives };
                    }
                    if text.contains(prompts::ALREADY_COMPLETE) {
                        self.write_checkpoint(p, WorkerPhase::Done, "already complete");
                        return WorkerOutcome::Complete { zero_change: true };
                    }
                    if text.contains(prompts::PLAN_REJECTED) {
                        return WorkerOutcome::Failed {
                            category: ErrorCategory::Planning,
                            message: first_lines(&text, 4),
                        };
                    }
                    break text;
                }
                Err(AgentError::RateLimited(message)) => {
                    return WorkerOutcome::Failed {
                        category: ErrorCategory::RateLimited,
                        message,
                    };
                }
                Err(AgentError::Cancelled) => {
                    return WorkerOutcome::Failed {
                        category: ErrorCategory::Stuck,
                        message: "cancelled by supervisor".into(),
                    };
                }
                Err(e) => {
                    p.last_error = Some(e.to_string());
                    match self.recover(p) {
                        Recovery::Fix | Recovery::Escalated(_) => continue,
                        Recovery::Fatal(category, message) => {
                            return WorkerOutcome::Failed { category, message };
                        }
                    }
                }
            }
        };
        p.plan = Some(plan.clone());

        // ---- execute / verify / fix / review / escalate -------------------
        let mut fixing = false;
        loop {
            self.drain_nudges(p);
            p.attempt += 1;
            if p.attempt > self.config.max_attempts {
                return WorkerOutcome::Failed {
                    category: ErrorCategory::TierCapExhausted,
                    message: format!(
                        "attempt budget ({}) exhausted; last error: {}",
                        self.config.max_attempts,
                        p.last_error.as_deref().unwrap_or("none")
                    ),
                };
            }

            let (phase, prompt) = if fixing {
                (
                    WorkerPhase::Fix,
                    prompts::fix_prompt(
                        &self.task,
                        p.last_error.as_deref().unwrap_or("unknown failure"),
                        &p.hints,
                    ),
                )
            } else {
                (
                    WorkerPhase::Execute,
                    prompts::execute_prompt(
                        &self.task,
                        &plan,
                        &self.briefing,
                        p.last_error.as_deref(),
                        &p.hints,
                    ),
                )
            };
            self.write_checkpoint(p, phase, "agent invoked");

            match self.invoke(&prompt, p).await {
                Ok(_) => {}
                Err(AgentError::RateLimited(message)) => {
                    return WorkerOutcome::Failed {
                        category: ErrorCategory::RateLimited,
                        message,
                    };
                }
                Err(AgentError::Cancelled) => {
                    return WorkerOutcome::Failed {
                        category: ErrorCategory::Stuck,
                        message: "cancelled by supervisor".into(),
                    };
                }
                Err(e) => {
                    p.last_error = Some(e.to_string());
                    match self.recover(p) {
                        Recovery::Fix => {
                            fixing = true;
                            continue;
                        }
                        Recovery::Escalated(_) => {
                            fixing = false;
                            continue;
                        }
                        Recovery::Fatal(category, message) => {
                            return WorkerOutcome::Failed { category, message };
                        }
                    }
                }
            }

            // ---- verify ---------------------------------------------------
            self.write_checkpoint(p, WorkerPhase::Verify, "running verification");
            let report = match self.verify.run(&self.worktree_path).await {
                Ok(report) => report,
                Err(e) => {
                    return WorkerOutcome::Failed {
                        category: ErrorCategory::Internal,
                        message: format!("verification runner failed: {e:#}"),
                    };
                }
            };

            if !report.passed() {
                let kind = report.failure_kind().unwrap_or(VerifyKind::Build);
                p.last_error = Some(report.failure_summary(2048));
                tracing::info!(
                    task_id = %self.task.id,
                    kind = %kind,
                    tier = %p.tier,
                    "verification failed"
                );
                match self.recover(p) {
                    Recovery::Fix => {
                        fixing = true;
                        continue;
                    }
                    Recovery::Escalated(_) => {
                        fixing = false;
                        continue;
                    }
                    Recovery::Fatal(category, message) => {
                        return WorkerOutcome::Failed { category, message };
                    }
                }
            }

            // ---- review ---------------------------------------------------
            if self.config.review_passes {
                let max_passes = if p.tier == ModelTier::Opus {
                    self.config.max_opus_review_passes
                } else {
                    self.config.max_review_passes_per_tier
                };
                if p.review_done < max_passes {
                    p.review_done += 1;
                    self.write_checkpoint(p, WorkerPhase::Review, "review pass");
                    let prompt = prompts::review_prompt(&self.task, &plan);
                    match self.invoke(&prompt, p).await {
                        Ok(result) => {
                            let issues = prompts::parse_blocking_issues(&result.text);
                            if !issues.is_empty() {
                                p.last_error = Some(format!(
                                    "review surfaced blocking issues:\n{}",
                                    issues.join("\n")
                                ));
                                match self.recover(p) {
                                    Recovery::Fix => {
                                        fixing = true;
                                        continue;
                                    }
                                    Recovery::Escalated(_) => {
                                        fixing = false;
                                        continue;
                                    }
                                    Recovery::Fatal(category, message) => {
                                        return WorkerOutcome::Failed { category, message };
                                    }
                                }
                            }
                        }
                        Err(AgentError::RateLimited(message)) => {
                            return WorkerOutcome::Failed {
                                category: ErrorCategory::RateLimited,
                                message,
                            };
                        }
                        Err(AgentError::Cancelled) => {
                            return WorkerOutcome::Failed {
                                category: ErrorCategory::Stuck,
                                message: "cancelled by supervisor".into(),
                            };
                        }
                        Err(e) => {
                            // Review is advisory; a flaky transport here
                            // does not fail a verified change.
                            tracing::warn!(
                                task_id = %self.task.id,
                                error = %e,
                                "review pass failed, accepting verified change"
                            );
                        }
                    }
                }
            }

            // ---- complete -------------------------------------------------
            let modified = self.modified_files();
            let zero_change = modified.is_empty();
            if self.config.auto_commit && !zero_change {
                match self.commit_work(p.attempt) {
                    Ok(true) => {
                        tracing::info!(task_id = %self.task.id, "committed worker changes");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(
                            task_id = %self.task.id,
                            error = %e,
                            "failed to commit worker changes (non-fatal)"
                        );
                    }
                }
            }
            self.write_checkpoint(p, WorkerPhase::Done, "complete");
            return WorkerOutcome::Complete { zero_change };
        }
    }

    /// Decide what to do after a failure at the current tier: burn a fix
    /// attempt, escalate, or give up.
    fn recover(&self, p: &mut Progress) -> Recovery {
        if p.tier_fix < self.config.max_retries_per_tier {
            p.tier_fix += 1;
            return Recovery::Fix;
        }

        let next = p.tier.next().filter(|n| *n <= self.config.max_tier);
        let Some(next) = next else {
            return Recovery::Fatal(
                ErrorCategory::TierCapExhausted,
                format!(
                    "exhausted retries at {} with no higher tier; last error: {}",
                    p.tier,
                    p.last_error.as_deref().unwrap_or("none")
                ),
            );
        };

        if next == ModelTier::Opus {
            let allowed = self
                .opus_budget
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .try_start_opus();
            if !allowed {
                return Recovery::Fatal(
                    ErrorCategory::BudgetExceeded,
                    "opus budget exhausted, cannot escalate".into(),
                );
            }
            p.escalated_to_opus = true;
        }

        tracing::info!(
            task_id = %self.task.id,
            from = %p.tier,
            to = %next,
            "escalating model tier"
        );
        p.tier = next;
        p.tier_fix = 0;
        p.review_done = 0;
        self.write_checkpoint(p, WorkerPhase::Escalate, "escalated");
        Recovery::Escalated(next)
    }

    async fn invoke(&self, prompt: &str, p: &mut Progress) -> Result<AgentResult, AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let request = AgentRequest {
            task_id: self.task.id,
            prompt: prompt.to_owned(),
            tier: p.tier,
            cwd: self.worktree_path.clone(),
            timeout: self.config.agent_timeout,
            cancel: self.cancel.clone(),
        };
        let result = self.runner.run(request).await?;
        p.input_tokens += result.input_tokens;
        p.output_tokens += result.output_tokens;
        Ok(result)
    }

    /// Fold any pending supervisor hints into the next prompt.
    fn drain_nudges(&mut self, p: &mut Progress) {
        while let Ok(hint) = self.nudges.try_recv() {
            tracing::info!(task_id = %self.task.id, hint = %hint, "received supervisor hint");
            p.hints.push(hint);
        }
    }

    /// Checkpoint discipline: one durable record per phase boundary.
    /// Failures are logged, never fatal -- losing a checkpoint must not
    /// kill a healthy worker.
    fn write_checkpoint(&self, p: &Progress, phase: WorkerPhase, step: &str) {
        let checkpoint = Checkpoint {
            task_id: self.task.id,
            phase,
            tier: p.tier,
            attempt: p.attempt,
            tier_attempt: p.tier_fix,
            last_step: step.to_owned(),
            files_touched: self.modified_files(),
            last_error: p.last_error.clone(),
            resume_context: p.plan.as_deref().map(|plan| first_lines(plan, 12)),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.write_checkpoint(&checkpoint) {
            tracing::warn!(task_id = %self.task.id, error = %e, "failed to write checkpoint");
        }
    }

    /// Files changed relative to the branch base: committed deltas plus
    /// anything dirty in the working tree. The assignment marker is
    /// infrastructure, not work product, and is excluded.
    fn modified_files(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(diff) = git::git(
            &self.worktree_path,
            &["diff", "--name-only", &self.base_sha, "HEAD"],
        ) {
            out.extend(diff.lines().map(str::to_owned));
        }
        if let Ok(status) = git::git(&self.worktree_path, &["status", "--porcelain"]) {
            for line in status.lines() {
                if line.len() > 3 {
                    let path = line[3..].trim().trim_matches('"');
                    out.push(path.to_owned());
                }
            }
        }
        out.retain(|path| path != undercity_state::layout::ASSIGNMENT_FILE_NAME);
        out.sort();
        out.dedup();
        out
    }

    fn scope_violations(&self, modified: &[String]) -> Vec<String> {
        let claimed = self.briefing.sibling_files();
        modified
            .iter()
            .filter(|f| claimed.contains(&f.as_str()))
            .cloned()
            .collect()
    }

    /// Stage and commit everything in the worktree. Returns whether a
    /// commit was created.
    fn commit_work(&self, attempt: u32) -> anyhow::Result<bool> {
        use anyhow::Context;

        let dir = &self.worktree_path;
        // Worktree-local identity so commits work without global config.
        let _ = git::git(dir, &["config", "user.email", "grid@undercity.local"]);
        let _ = git::git(dir, &["config", "user.name", "undercity"]);

        git::git(dir, &["add", "-A"]).context("git add -A failed")?;
        // The assignment marker stays out of history.
        let _ = git::git(
            dir,
            &["reset", "-q", "--", undercity_state::layout::ASSIGNMENT_FILE_NAME],
        );

        let staged =
            git::git(dir, &["diff", "--cached", "--name-only"]).context("git diff failed")?;
        if staged.trim().is_empty() {
            return Ok(false);
        }

        let mut summary: String = self.task.objective.chars().take(60).collect();
        if self.task.objective.chars().count() > 60 {
            summary.push_str("...");
        }
        let message = format!("undercity: {summary} (attempt {attempt})");
        git::git(dir, &["commit", "-m", &message]).context("git commit failed")?;
        Ok(true)
    }
}

fn first_lines(text: &str, n: usize) -> String {
    text.lines().take(n).collect::<Vec<_>>().join("\n")
}
