//! The top-level orchestrator: admits tasks from the board into a
//! bounded worker pool, supervises the batch, drives the merge pipeline,
//! and is the single point of board mutation.
//!
//! One grind session = a sequence of batches. Each batch: select
//! runnable tasks (priority order, duplicate and conflict filters),
//! create worktrees, spawn workers, join them unordered over a channel,
//! ingest results, then merge winners serially. Rate-limit pauses and
//! emergency mode short-circuit admission; drain lets in-flight workers
//! finish and admits nothing new.

pub mod budget;
pub mod meta;
pub mod ring;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use undercity_state::atomic;
use undercity_state::board::{TaskBoard, DUPLICATE_JACCARD_THRESHOLD};
use undercity_state::events::{Event, EventLog};
use undercity_state::layout::{StateLayout, ASSIGNMENT_FILE_NAME};
use undercity_state::models::{
    ActiveTaskState, BatchMetadata, CompletedTaskState, ErrorCategory, HandoffContext, ModelTier,
    Task, TaskAssignment, TaskStatus,
};
use undercity_state::recovery::RecoveryStore;

use crate::agent::AgentRunner;
use crate::emergency::EmergencyMode;
use crate::guidance::{HumanGuidanceStore, NEEDS_HUMAN_INPUT_TAG};
use crate::health::{HealthMonitor, HealthMonitorConfig, WorkerHandle, WorkerRegistry};
use crate::merge::{MergeCandidate, MergeConfig, MergePipeline};
use crate::tracker::files::{AccessKind, FileTracker, PREDICTION_CONFIDENCE_THRESHOLD};
use crate::tracker::rate_limit::{RateLimitConfig, RateLimitTracker, UsageSummary};
use crate::verify::VerifyRunner;
use crate::worker::briefing::{Briefing, BriefingDepth, SiblingBoundary};
use crate::worker::{prompts, Worker, WorkerConfig, WorkerOutcome, WorkerReport};
use crate::worktree::{WorktreeInfo, WorktreeManager};
use budget::OpusBudget;
use ring::{PreservedRing, PreservedWorktree, DEFAULT_RING_CAPACITY};

/// Hard cap on concurrent workers regardless of configuration.
pub const MAX_CONCURRENT_HARD_CAP: usize = 5;

/// Tag carried by orchestrator-seeded emergency fix tasks.
pub const EMERGENCY_FIX_TAG: &str = "emergency-fix";

/// Session options, mostly surfaced as `grind` flags.
#[derive(Debug, Clone)]
pub struct GrindOptions {
    pub max_concurrent: usize,
    /// Stop after this many tasks have been processed (None = drain the
    /// board).
    pub max_tasks: Option<usize>,
    pub starting_model: ModelTier,
    pub max_tier: ModelTier,
    pub push_on_success: bool,
    /// Honor `NEEDS_DECOMPOSITION` by splitting the task; when off, the
    /// refusal fails the task instead.
    pub decompose_enabled: bool,
    pub review_passes: bool,
    pub dry_run: bool,
    pub max_retries_per_tier: u32,
    pub max_attempts: u32,
    pub agent_timeout: Duration,
    pub verify_timeout: Duration,
}

impl Default for GrindOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_tasks: None,
            starting_model: ModelTier::Sonnet,
            max_tier: ModelTier::Opus,
            push_on_success: false,
            decompose_enabled: true,
            review_passes: true,
            dry_run: false,
            max_retries_per_tier: 2,
            max_attempts: 8,
            agent_timeout: Duration::from_secs(1800),
            verify_timeout: Duration::from_secs(300),
        }
    }
}

/// End-of-session report.
#[derive(Debug, Default, serde::Serialize)]
pub struct GrindSummary {
    pub batches: usize,
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub merged: usize,
    pub decomposed: usize,
    pub parked: usize,
    pub deferred: usize,
    pub by_category: BTreeMap<String, usize>,
    /// Final tier -> task count.
    pub model_distribution: BTreeMap<String, usize>,
    pub duration_ms: u64,
    pub rate_limited: bool,
    pub emergency: bool,
    pub opus_started: usize,
    /// Objectives that would run, when `dry_run` is set.
    pub dry_run_selected: Vec<String>,
    pub usage: Option<UsageSummary>,
}

struct BatchSelection {
    admitted: Vec<Task>,
    deferred: usize,
}

/// The orchestrator owns every tracker and store for the session.
pub struct Orchestrator {
    layout: StateLayout,
    board: TaskBoard,
    recovery: RecoveryStore,
    events: EventLog,
    worktrees: WorktreeManager,
    verify: VerifyRunner,
    files: FileTracker,
    rate_limit: RateLimitTracker,
    emergency: EmergencyMode,
    guidance: HumanGuidanceStore,
    registry: WorkerRegistry,
    preserved: PreservedRing,
    runner: Arc<dyn AgentRunner>,
    opus: Arc<Mutex<OpusBudget>>,
    drain: CancellationToken,
    on_drained: Option<Box<dyn FnOnce() + Send>>,
    options: GrindOptions,
    monitor_config: HealthMonitorConfig,
}

impl Orchestrator {
    /// Wire up an orchestrator for the repository at `repo_root` with
    /// state under `<repo_root>/.undercity/`.
    pub fn new(
        repo_root: impl Into<PathBuf>,
        runner: Arc<dyn AgentRunner>,
        mut options: GrindOptions,
    ) -> Result<Self> {
        let repo_root = repo_root.into();
        options.max_concurrent = options.max_concurrent.clamp(1, MAX_CONCURRENT_HARD_CAP);

        let layout = StateLayout::for_project(&repo_root);
        layout.ensure()?;

        let board = TaskBoard::open(layout.tasks_file())?;
        let recovery = RecoveryStore::open(&layout)?;
        let events = EventLog::new(layout.events_file());
        let worktrees = WorktreeManager::new(&repo_root, None)
            .map_err(|e| anyhow::anyhow!("worktree manager init failed: {e}"))?;
        let verify = VerifyRunner::detect(&repo_root).with_timeout(options.verify_timeout);
        let files = FileTracker::open(&layout)?;
        let rate_limit = RateLimitTracker::open(&layout, RateLimitConfig::default())?;
        let emergency = EmergencyMode::open(&layout)?;
        let guidance = HumanGuidanceStore::open(&layout)?;
        let preserved = PreservedRing::open(&layout, DEFAULT_RING_CAPACITY)?;

        Ok(Self {
            layout,
            board,
            recovery,
            events,
            worktrees,
            verify,
            files,
            rate_limit,
            emergency,
            guidance,
            registry: WorkerRegistry::new(),
            preserved,
            runner,
            opus: Arc::new(Mutex::new(OpusBudget::new())),
            drain: CancellationToken::new(),
            on_drained: None,
            options,
            monitor_config: HealthMonitorConfig::default(),
        })
    }

    /// Override the health-monitor tuning (tests use short thresholds).
    pub fn with_monitor_config(mut self, config: HealthMonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    /// Token that freezes admission when cancelled. In-flight workers
    /// finish normally.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Callback fired once after the last in-flight worker of a drained
    /// session terminates.
    pub fn set_drain_callback(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.on_drained = Some(callback);
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    pub fn usage_summary(&self) -> UsageSummary {
        self.rate_limit.usage_summary()
    }

    fn draining(&self) -> bool {
        self.drain.is_cancelled() || self.layout.drain_file().exists()
    }

    /// Push externally observed usage into the tracker (best effort,
    /// called by whoever scrapes the provider's meters).
    pub fn sync_usage(&mut self, five_hour_pct: f64, weekly_pct: f64) -> Result<()> {
        self.rate_limit
            .sync_with_actual_usage(five_hour_pct, weekly_pct)?;
        Ok(())
    }

    /// Run batches until the board is drained, a gate trips, or the
    /// session cap is reached.
    pub async fn grind(&mut self) -> Result<GrindSummary> {
        let started = Instant::now();
        let mut summary = GrindSummary::default();

        // A leftover drain marker from a previous session would freeze
        // admission forever.
        let _ = std::fs::remove_file(self.layout.drain_file());

        self.reconcile_recovery()?;
        let _ = self.worktrees.prune_stale();

        let monitor = HealthMonitor::new(
            self.recovery.clone(),
            self.registry.clone(),
            self.monitor_config.clone(),
        );
        let (monitor_handle, monitor_stop) = monitor.spawn();

        let result = self.grind_inner(&mut summary).await;

        monitor_stop.cancel();
        let _ = monitor_handle.await;

        summary.duration_ms = started.elapsed().as_millis() as u64;
        summary.opus_started = self
            .opus
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .opus_started();
        summary.usage = Some(self.rate_limit.usage_summary());

        if self.draining() {
            if let Some(callback) = self.on_drained.take() {
                callback();
            }
        }

        result?;
        Ok(summary)
    }

    async fn grind_inner(&mut self, summary: &mut GrindSummary) -> Result<()> {
        loop {
            // 1. Rate-limit gate.
            self.rate_limit.check_auto_resume()?;
            if self.rate_limit.is_paused() {
                tracing::warn!(
                    reason = self.rate_limit.pause_reason().unwrap_or("unknown"),
                    "rate-limit pause active, stopping admission"
                );
                summary.rate_limited = true;
                return Ok(());
            }

            // 2. Emergency gate.
            if self.emergency.is_active() {
                summary.emergency = true;
                if !self.run_emergency_cycle(summary).await? {
                    return Ok(());
                }
                if self.emergency.is_active() {
                    // The repair ran but mainline is still broken.
                    return Ok(());
                }
                continue;
            }

            // 3. Drain.
            if self.draining() {
                tracing::info!("drain requested, stopping admission");
                return Ok(());
            }

            // 4. Session cap.
            let remaining = match self.options.max_tasks {
                Some(cap) if summary.processed >= cap => return Ok(()),
                Some(cap) => (cap - summary.processed).min(self.options.max_concurrent),
                None => self.options.max_concurrent,
            };

            // 5. Select and run one batch.
            let selection = self.select_batch(remaining);
            summary.deferred += selection.deferred;
            if selection.admitted.is_empty() {
                return Ok(());
            }

            if self.options.dry_run {
                for task in &selection.admitted {
                    summary.dry_run_selected.push(task.objective.clone());
                }
                return Ok(());
            }

            summary.batches += 1;
            self.run_batch(selection.admitted, summary).await?;
        }
    }

    /// One emergency-mode cycle: seed the fix task if allowed and run it.
    /// Returns `false` when there is nothing left to try automatically.
    async fn run_emergency_cycle(&mut self, summary: &mut GrindSummary) -> Result<bool> {
        let reason = self
            .emergency
            .state()
            .reason
            .clone()
            .unwrap_or_else(|| "mainline verification failing".into());

        let has_fix_task = !self
            .board
            .list(&undercity_state::board::TaskFilter {
                status: Some(TaskStatus::Pending),
                tag: Some(EMERGENCY_FIX_TAG.into()),
                parent_id: None,
            })
            .is_empty();

        if !has_fix_task {
            if !self.emergency.can_auto_fix() {
                tracing::error!(
                    "emergency mode requires human intervention (fix attempts exhausted)"
                );
                return Ok(false);
            }
            let objective = format!("repair mainline verification: {reason}");
            let mut fix = Task::new(objective.clone(), i32::MAX);
            fix.tags.push(EMERGENCY_FIX_TAG.into());
            let id = self.board.add(fix)?;
            self.emergency.record_fix_attempt()?;
            self.events.append(&Event::TaskQueued {
                task_id: id,
                objective,
                priority: i32::MAX,
                at: Utc::now(),
            })?;
            tracing::warn!(task_id = %id, "seeded emergency fix task");
        }

        let fix_tasks: Vec<Task> = self
            .board
            .list_pending()
            .into_iter()
            .filter(|t| t.tags.iter().any(|tag| tag == EMERGENCY_FIX_TAG))
            .take(1)
            .cloned()
            .collect();
        if fix_tasks.is_empty() {
            return Ok(false);
        }

        summary.batches += 1;
        self.run_batch(fix_tasks, summary).await?;
        Ok(true)
    }

    /// Reconcile the board with completion records from a crashed
    /// session. Stale `in_progress` board entries stay runnable: the
    /// admission query returns them alongside pending.
    fn reconcile_recovery(&mut self) -> Result<()> {
        for record in self.recovery.get_completed_tasks()? {
            let Some(task) = self.board.get(record.task_id) else {
                continue;
            };
            if task.status.is_terminal() || task.status == record.status {
                continue;
            }
            tracing::info!(
                task_id = %record.task_id,
                status = %record.status,
                "applying completion record from previous session"
            );
            if let Err(e) = self.board.update_status(
                record.task_id,
                record.status,
                record.error_message.clone(),
            ) {
                tracing::warn!(task_id = %record.task_id, error = %e, "reconcile failed");
            }
        }
        let stale = self.recovery.scan_active_tasks()?;
        if !stale.is_empty() {
            tracing::info!(
                count = stale.len(),
                "previous session left tasks in flight; they will be re-admitted"
            );
        }
        Ok(())
    }

    /// Predicted touch set for admission shaping: the task's own
    /// estimate, else confident predictor output (which falls back to
    /// path extraction when cold).
    fn predicted_paths(&self, task: &Task) -> Vec<(String, f64)> {
        if let Some(estimate) = &task.estimated_files {
            if !estimate.is_empty() {
                return estimate.iter().map(|f| (f.clone(), 1.0)).collect();
            }
        }
        self.files
            .predict_relevant_files(&task.objective, 8)
            .into_iter()
            .filter(|(_, confidence)| *confidence >= PREDICTION_CONFIDENCE_THRESHOLD)
            .collect()
    }

    /// Pick up to `limit` runnable tasks: board order (priority desc,
    /// age asc), minus duplicates of in-progress work, shaped so no two
    /// admitted tasks predict the same file.
    fn select_batch(&mut self, limit: usize) -> BatchSelection {
        let mut admitted: Vec<Task> = Vec::new();
        let mut deferred = 0usize;
        let mut claimed: HashSet<String> = HashSet::new();

        let pending: Vec<Task> = self.board.list_pending().into_iter().cloned().collect();
        for task in pending {
            if admitted.len() >= limit {
                break;
            }
            // Parked tasks wait for guidance.
            if task.tags.iter().any(|t| t == NEEDS_HUMAN_INPUT_TAG)
                && task
                    .handoff
                    .as_ref()
                    .is_none_or(|h| h.human_guidance.is_none())
            {
                continue;
            }
            // Duplicate filter against in-progress work (Jaccard).
            if let Some(dup) = self
                .board
                .find_similar_in_progress(&task.objective, DUPLICATE_JACCARD_THRESHOLD)
            {
                if dup.id != task.id {
                    tracing::info!(
                        task_id = %task.id,
                        duplicate_of = %dup.id,
                        "skipping near-duplicate of in-progress task"
                    );
                    continue;
                }
            }
            // Meta tasks have no file footprint.
            if task.meta_type().is_some() {
                admitted.push(task);
                continue;
            }
            // Conflict-aware shaping.
            let predicted = self.predicted_paths(&task);
            if predicted.iter().any(|(path, _)| claimed.contains(path)) {
                tracing::info!(
                    task_id = %task.id,
                    "deferring task: predicted file conflict with admitted peer"
                );
                deferred += 1;
                continue;
            }
            claimed.extend(predicted.into_iter().map(|(path, _)| path));
            admitted.push(task);
        }

        BatchSelection { admitted, deferred }
    }

    /// Sibling boundaries for a decomposed subtask: every other live
    /// subtask of the same parent and the files it claims.
    fn sibling_boundaries(&self, task: &Task) -> Vec<SiblingBoundary> {
        let Some(parent_id) = task.parent_id else {
            return Vec::new();
        };
        let Some(parent) = self.board.get(parent_id) else {
            return Vec::new();
        };
        parent
            .subtask_ids
            .iter()
            .filter(|id| **id != task.id)
            .filter_map(|id| self.board.get(*id))
            .filter(|sibling| !sibling.status.is_terminal())
            .map(|sibling| SiblingBoundary {
                objective: sibling.objective.clone(),
                files: sibling.estimated_files.clone().unwrap_or_else(|| {
                    self.predicted_paths(sibling)
                        .into_iter()
                        .map(|(path, _)| path)
                        .collect()
                }),
            })
            .filter(|boundary| !boundary.files.is_empty())
            .collect()
    }

    /// Run one batch to completion: spawn, join, ingest, merge, clean up.
    async fn run_batch(&mut self, tasks: Vec<Task>, summary: &mut GrindSummary) -> Result<()> {
        let batch_id = Uuid::new_v4();
        let batch_started = Instant::now();

        self.recovery.save_batch_metadata(&BatchMetadata {
            batch_id,
            task_ids: tasks.iter().map(|t| t.id).collect(),
            max_concurrent: self.options.max_concurrent,
            starting_model: self.options.starting_model,
            started_at: Utc::now(),
        })?;
        self.events.append(&Event::GrindStart {
            batch_id,
            task_count: tasks.len(),
            max_concurrent: self.options.max_concurrent,
            at: Utc::now(),
        })?;

        let (meta_tasks, worker_tasks): (Vec<Task>, Vec<Task>) =
            tasks.into_iter().partition(|t| t.meta_type().is_some());

        // Meta-tasks run serially in the main checkout, no worktree.
        for task in meta_tasks {
            summary.processed += 1;
            self.opus
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .note_task();
            self.run_meta_task(&task, batch_id, summary).await;
        }

        // Spawn workers.
        let (tx, mut rx) = mpsc::channel::<WorkerReport>(self.options.max_concurrent.max(1) * 2);
        let mut spawned = 0usize;
        let mut worktrees_by_task: BTreeMap<Uuid, WorktreeInfo> = BTreeMap::new();
        let mut tasks_by_id: BTreeMap<Uuid, Task> = BTreeMap::new();

        for task in worker_tasks {
            summary.processed += 1;
            self.opus
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .note_task();

            match self.spawn_worker(&task, batch_id, tx.clone()).await {
                Ok(info) => {
                    worktrees_by_task.insert(task.id, info);
                    tasks_by_id.insert(task.id, task);
                    spawned += 1;
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "worker spawn failed");
                    self.record_failure(
                        &task,
                        batch_id,
                        ErrorCategory::WorktreeCreateFailed,
                        &format!("{e:#}"),
                        summary,
                    )?;
                }
            }
        }
        drop(tx);

        // Join unordered.
        let mut reports: Vec<WorkerReport> = Vec::with_capacity(spawned);
        while reports.len() < spawned {
            match rx.recv().await {
                Some(report) => reports.push(report),
                None => break,
            }
        }

        // Ingest results; collect merge candidates.
        let mut candidates: Vec<MergeCandidate> = Vec::new();
        for report in reports {
            let Some(task) = tasks_by_id.get(&report.task_id).cloned() else {
                continue;
            };
            let info = worktrees_by_task.get(&report.task_id).cloned();
            if let Some(candidate) =
                self.ingest_report(&task, batch_id, &report, info.as_ref(), summary)?
            {
                candidates.push(candidate);
            }
        }

        // Merge winners serially, gated by mainline health.
        if !candidates.is_empty() {
            self.drive_merges(batch_id, candidates, &worktrees_by_task, summary)
                .await?;
        }

        // Parent auto-close for any completed subtasks.
        let parents: HashSet<Uuid> = tasks_by_id.values().filter_map(|t| t.parent_id).collect();
        for parent in parents {
            if self.board.complete_parent_if_all_subtasks_done(parent)? {
                self.events.append(&Event::TaskComplete {
                    task_id: parent,
                    batch_id,
                    duration_ms: 0,
                    merged: false,
                    at: Utc::now(),
                })?;
            }
        }

        self.events.append(&Event::GrindEnd {
            batch_id,
            completed: summary.completed,
            failed: summary.failed,
            merged: summary.merged,
            duration_ms: batch_started.elapsed().as_millis() as u64,
            at: Utc::now(),
        })?;
        self.recovery.clear_batch(batch_id)?;
        Ok(())
    }

    /// Create the worktree, write records, and spawn the worker task.
    async fn spawn_worker(
        &mut self,
        task: &Task,
        batch_id: Uuid,
        tx: mpsc::Sender<WorkerReport>,
    ) -> Result<WorktreeInfo> {
        let info = self
            .worktrees
            .create_worktree(task.id)
            .map_err(|e| anyhow::anyhow!("worktree creation failed: {e}"))?;

        // Start tier, downgraded if the opus budget is spent.
        let mut start_tier = self.options.starting_model.min(self.options.max_tier);
        if start_tier == ModelTier::Opus {
            let allowed = self
                .opus
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .try_start_opus();
            if !allowed {
                tracing::info!(task_id = %task.id, "opus budget spent, starting at sonnet");
                start_tier = ModelTier::Sonnet;
            }
        }

        let worker_config = WorkerConfig {
            starting_tier: start_tier,
            max_tier: self.options.max_tier,
            max_retries_per_tier: self.options.max_retries_per_tier,
            max_attempts: self.options.max_attempts,
            review_passes: self.options.review_passes,
            agent_timeout: self.options.agent_timeout,
            ..WorkerConfig::default()
        };

        // Assignment record inside the worktree.
        atomic::write_json_atomic(
            &info.path.join(ASSIGNMENT_FILE_NAME),
            &TaskAssignment {
                task_id: task.id,
                objective: task.objective.clone(),
                model: start_tier,
                branch: info.branch.clone(),
                max_attempts: worker_config.max_attempts,
                push_on_success: self.options.push_on_success,
                review_passes: worker_config.review_passes,
            },
        )?;

        self.board
            .update_status(task.id, TaskStatus::InProgress, None)?;
        self.recovery.write_active_task(&ActiveTaskState {
            task_id: task.id,
            batch_id,
            objective: task.objective.clone(),
            status: TaskStatus::InProgress,
            branch: info.branch.clone(),
            worktree_path: Some(info.path.clone()),
            model: start_tier,
            started_at: Utc::now(),
        })?;

        let predicted = self.predicted_paths(task);
        self.files.start_task_tracking(task.id, info.path.clone())?;
        self.files.set_predicted_files(task.id, &predicted)?;

        let briefing = Briefing::build(
            &info.path,
            &predicted
                .iter()
                .map(|(path, _)| path.clone())
                .collect::<Vec<_>>(),
            self.sibling_boundaries(task),
            BriefingDepth::for_tier(start_tier),
        );

        let (nudge_tx, nudge_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        self.registry.register(WorkerHandle {
            task_id: task.id,
            batch_id,
            nudge: nudge_tx,
            cancel: cancel.clone(),
        });

        self.events.append(&Event::TaskStarted {
            task_id: task.id,
            batch_id,
            model: start_tier,
            branch: info.branch.clone(),
            at: Utc::now(),
        })?;

        let worker = Worker {
            task: task.clone(),
            briefing,
            worktree_path: info.path.clone(),
            base_sha: info.base_sha.clone(),
            config: worker_config,
            runner: Arc::clone(&self.runner),
            store: self.recovery.clone(),
            verify: self.verify.clone(),
            cancel,
            nudges: nudge_rx,
            opus_budget: Arc::clone(&self.opus),
        };
        tokio::spawn(async move {
            let report = worker.run().await;
            let _ = tx.send(report).await;
        });

        Ok(info)
    }

    /// Fold one worker report into board, trackers, and recovery.
    /// Returns a merge candidate for completed non-trivial work.
    fn ingest_report(
        &mut self,
        task: &Task,
        batch_id: Uuid,
        report: &WorkerReport,
        info: Option<&WorktreeInfo>,
        summary: &mut GrindSummary,
    ) -> Result<Option<MergeCandidate>> {
        self.registry.unregister(task.id);
        *summary
            .model_distribution
            .entry(report.tier.as_str().to_owned())
            .or_default() += 1;
        self.rate_limit.record_task(
            task.id,
            report.tier,
            report.input_tokens,
            report.output_tokens,
            report.duration_ms,
        )?;
        let attempt_error = match &report.outcome {
            WorkerOutcome::Failed { message, .. } => Some(message.clone()),
            _ => None,
        };
        self.board.record_attempt(task.id, report.tier, attempt_error)?;
        for file in &report.modified_files {
            self.files.record_access(task.id, file, AccessKind::Edit)?;
        }

        match &report.outcome {
            WorkerOutcome::Complete { zero_change } => {
                if *zero_change {
                    // Nothing to merge; terminal right away.
                    self.board
                        .update_status(task.id, TaskStatus::Complete, None)?;
                    self.recovery.mark_task_completed(&CompletedTaskState {
                        task_id: task.id,
                        batch_id,
                        status: TaskStatus::Complete,
                        error: None,
                        error_message: None,
                        modified_files: Vec::new(),
                        merged_sha: None,
                        finished_at: Utc::now(),
                    })?;
                    self.events.append(&Event::TaskComplete {
                        task_id: task.id,
                        batch_id,
                        duration_ms: report.duration_ms,
                        merged: false,
                        at: Utc::now(),
                    })?;
                    summary.completed += 1;
                    self.files.stop_task_tracking(task.id)?;
                    if let Some(info) = info {
                        let _ = self.worktrees.remove_worktree(&info.path, true);
                        let _ = self.worktrees.delete_branch(&info.branch);
                    }
                    return Ok(None);
                }
                // Merge decides the terminal state.
                let info = info.context("completed worker without a worktree")?;
                Ok(Some(MergeCandidate {
                    task_id: task.id,
                    parent_id: task.parent_id,
                    branch: info.branch.clone(),
                    worktree_path: info.path.clone(),
                }))
            }
            WorkerOutcome::Decompose { subtask_objectives } => {
                if !self.options.decompose_enabled {
                    self.record_failure(
                        task,
                        batch_id,
                        ErrorCategory::DecompositionRequested,
                        "decomposition disabled for this session",
                        summary,
                    )?;
                    if let Some(info) = info {
                        self.preserve_or_remove(info, false);
                    }
                    return Ok(None);
                }
                let subtasks: Vec<Task> = subtask_objectives
                    .iter()
                    .map(|objective| Task::new(objective.clone(), 0))
                    .collect();
                let child_ids = self.board.decompose(task.id, subtasks)?;
                for (child_id, objective) in child_ids.iter().zip(subtask_objectives) {
                    self.events.append(&Event::TaskQueued {
                        task_id: *child_id,
                        objective: objective.clone(),
                        priority: task.priority,
                        at: Utc::now(),
                    })?;
                }
                self.recovery.mark_task_completed(&CompletedTaskState {
                    task_id: task.id,
                    batch_id,
                    status: TaskStatus::Decomposed,
                    error: None,
                    error_message: None,
                    modified_files: Vec::new(),
                    merged_sha: None,
                    finished_at: Utc::now(),
                })?;
                self.events.append(&Event::TaskComplete {
                    task_id: task.id,
                    batch_id,
                    duration_ms: report.duration_ms,
                    merged: false,
                    at: Utc::now(),
                })?;
                summary.decomposed += 1;
                self.files.stop_task_tracking(task.id)?;
                if let Some(info) = info {
                    let _ = self.worktrees.remove_worktree(&info.path, true);
                    let _ = self.worktrees.delete_branch(&info.branch);
                }
                Ok(None)
            }
            WorkerOutcome::Failed { category, message } => {
                self.record_failure(task, batch_id, category.clone(), message, summary)?;
                if let Some(info) = info {
                    self.preserve_or_remove(info, true);
                }
                Ok(None)
            }
        }
    }

    /// Record a terminal failure everywhere it must appear: board (failed
    /// or parked), guidance store, recovery, event log, summary.
    fn record_failure(
        &mut self,
        task: &Task,
        batch_id: Uuid,
        category: ErrorCategory,
        message: &str,
        summary: &mut GrindSummary,
    ) -> Result<()> {
        self.registry.unregister(task.id);
        let occurrences = self.guidance.record_failure(task.id, message)?;
        let park = self.guidance.should_park(message);

        let status = if park {
            TaskStatus::Blocked
        } else {
            TaskStatus::Failed
        };
        // A task that never left pending (spawn failure) takes the failed
        // edge through in_progress.
        if self
            .board
            .get(task.id)
            .is_some_and(|t| t.status == TaskStatus::Pending)
        {
            let _ = self
                .board
                .update_status(task.id, TaskStatus::InProgress, None);
        }
        self.board
            .update_status(task.id, status, Some(message.to_owned()))?;
        if park {
            self.board.add_tag(task.id, NEEDS_HUMAN_INPUT_TAG)?;
            self.board.set_handoff(
                task.id,
                HandoffContext {
                    prior_attempt_summary: Some(message.chars().take(1000).collect()),
                    human_guidance: None,
                    retry: false,
                },
            )?;
            summary.parked += 1;
            tracing::warn!(
                task_id = %task.id,
                occurrences,
                "task parked for human input (repeated failure signature)"
            );
        }

        self.recovery.mark_task_completed(&CompletedTaskState {
            task_id: task.id,
            batch_id,
            status: TaskStatus::Failed,
            error: Some(category.clone()),
            error_message: Some(message.to_owned()),
            modified_files: Vec::new(),
            merged_sha: None,
            finished_at: Utc::now(),
        })?;
        self.events.append(&Event::TaskFailed {
            task_id: task.id,
            batch_id,
            error: category.clone(),
            message: Some(message.chars().take(500).collect()),
            at: Utc::now(),
        })?;
        summary.failed += 1;
        *summary.by_category.entry(category.to_string()).or_default() += 1;
        self.files.stop_task_tracking(task.id)?;
        Ok(())
    }

    /// Serial merge phase for a batch's winners.
    async fn drive_merges(
        &mut self,
        batch_id: Uuid,
        candidates: Vec<MergeCandidate>,
        worktrees_by_task: &BTreeMap<Uuid, WorktreeInfo>,
        summary: &mut GrindSummary,
    ) -> Result<()> {
        // Pre-merge health gate: only when emergency mode is not already
        // active (an active emergency batch is the repair itself).
        if !self.emergency.is_active()
            && !crate::emergency::gate_skipped()
            && !self.verify.is_empty()
        {
            let report = crate::emergency::mainline_health_check(
                &self.verify,
                self.worktrees.main_repo_path(),
            )
            .await?;
            if !report.passed() {
                let reason = format!(
                    "pre-merge health check failed: {}",
                    report
                        .failure_kind()
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| "unknown".into())
                );
                self.emergency.activate(&reason)?;
                summary.emergency = true;
                // Winners stay complete-but-unmerged; preserve their
                // worktrees for the eventual merge or investigation.
                for candidate in candidates {
                    self.board
                        .update_status(candidate.task_id, TaskStatus::Complete, None)?;
                    self.finish_merge_candidate(candidate.task_id, batch_id, None, summary)?;
                    if let Some(info) = worktrees_by_task.get(&candidate.task_id) {
                        self.preserve_or_remove(info, true);
                    }
                }
                return Ok(());
            }
        }

        let pipeline = MergePipeline::new(
            self.worktrees.clone(),
            self.verify.clone(),
            Arc::clone(&self.runner),
            MergeConfig {
                push_on_success: self.options.push_on_success,
                ..MergeConfig::default()
            },
        );
        let outcomes = pipeline.merge_batch(candidates).await;

        let mut any_merged = false;
        for outcome in outcomes {
            let task_id = outcome.task_id;
            let info = worktrees_by_task.get(&task_id);
            if outcome.success {
                any_merged = true;
                self.board
                    .update_status(task_id, TaskStatus::Complete, None)?;
                self.finish_merge_candidate(
                    task_id,
                    batch_id,
                    outcome.merged_sha.clone(),
                    summary,
                )?;
                // Feed the predictor with what actually changed.
                if let Some(task) = self.board.get(task_id).cloned() {
                    let edited = self.files.edited_files(task_id);
                    self.files.learn_from_completion(&task.objective, &edited)?;
                }
                self.files.stop_task_tracking(task_id)?;
                if let Some(info) = info {
                    let _ = self.worktrees.remove_worktree(&info.path, true);
                    let _ = self.worktrees.delete_branch(&info.branch);
                }
            } else {
                let category = outcome.category.clone().unwrap_or(ErrorCategory::Internal);
                let message = outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| "merge failed".into());
                if outcome.sibling_conflict {
                    tracing::warn!(
                        task_id = %task_id,
                        "sibling merge conflict (decomposition produced overlapping subtasks)"
                    );
                }
                if let Some(task) = self.board.get(task_id).cloned() {
                    self.record_failure(&task, batch_id, category, &message, summary)?;
                }
                if let Some(info) = info {
                    self.preserve_or_remove(info, true);
                }
            }
        }

        // Post-merge health check: confirms mainline, and clears an
        // active emergency once the repair lands.
        if any_merged && !self.verify.is_empty() && !crate::emergency::gate_skipped() {
            let report = crate::emergency::mainline_health_check(
                &self.verify,
                self.worktrees.main_repo_path(),
            )
            .await?;
            if report.passed() {
                if self.emergency.is_active() {
                    self.emergency.clear()?;
                }
            } else {
                self.emergency.activate("post-merge health check failed")?;
                summary.emergency = true;
            }
        }
        Ok(())
    }

    /// Terminal bookkeeping for a merge-phase winner.
    fn finish_merge_candidate(
        &mut self,
        task_id: Uuid,
        batch_id: Uuid,
        merged_sha: Option<String>,
        summary: &mut GrindSummary,
    ) -> Result<()> {
        let merged = merged_sha.is_some();
        self.recovery.mark_task_completed(&CompletedTaskState {
            task_id,
            batch_id,
            status: TaskStatus::Complete,
            error: None,
            error_message: None,
            modified_files: self.files.edited_files(task_id),
            merged_sha,
            finished_at: Utc::now(),
        })?;
        self.events.append(&Event::TaskComplete {
            task_id,
            batch_id,
            duration_ms: 0,
            merged,
            at: Utc::now(),
        })?;
        summary.completed += 1;
        if merged {
            summary.merged += 1;
        }
        Ok(())
    }

    /// Keep a failure worktree when it holds anything worth inspecting;
    /// otherwise remove it.
    fn preserve_or_remove(&mut self, info: &WorktreeInfo, preserve: bool) {
        if preserve && info.path.exists() {
            let entry = PreservedWorktree {
                task_id: info.task_id,
                path: info.path.clone(),
                branch: info.branch.clone(),
                reason: "failed or unmerged work".into(),
                preserved_at: Utc::now(),
            };
            if let Err(e) = self.preserved.preserve(entry, &self.worktrees) {
                tracing::warn!(error = %e, "failed to record preserved worktree");
            }
        } else {
            let _ = self.worktrees.remove_worktree(&info.path, true);
            let _ = self.worktrees.delete_branch(&info.branch);
        }
    }

    /// Run a `[meta:<type>]` task in the main checkout and arbitrate its
    /// recommendations.
    async fn run_meta_task(&mut self, task: &Task, batch_id: Uuid, summary: &mut GrindSummary) {
        let meta_type = task.meta_type().unwrap_or("unknown").to_owned();
        tracing::info!(task_id = %task.id, meta_type = %meta_type, "running meta task");

        if let Err(e) = self
            .board
            .update_status(task.id, TaskStatus::InProgress, None)
        {
            tracing::warn!(task_id = %task.id, error = %e, "meta task status update failed");
        }
        let _ = self.recovery.write_active_task(&ActiveTaskState {
            task_id: task.id,
            batch_id,
            objective: task.objective.clone(),
            status: TaskStatus::InProgress,
            branch: String::new(),
            worktree_path: None,
            model: self.options.starting_model,
            started_at: Utc::now(),
        });

        let board_json = self.board_digest();
        let request = crate::agent::AgentRequest {
            task_id: task.id,
            prompt: prompts::meta_prompt(&meta_type, &task.objective, &board_json),
            tier: self.options.starting_model.min(self.options.max_tier),
            cwd: self.worktrees.main_repo_path().to_path_buf(),
            timeout: self.options.agent_timeout,
            cancel: CancellationToken::new(),
        };

        let result = match self.runner.run(request).await {
            Ok(result) => result,
            Err(e) => {
                let _ = self.record_failure(
                    task,
                    batch_id,
                    ErrorCategory::WorkerCrashed,
                    &format!("meta agent failed: {e}"),
                    summary,
                );
                return;
            }
        };
        self.rate_limit
            .record_task(
                task.id,
                self.options.starting_model,
                result.input_tokens,
                result.output_tokens,
                result.duration.as_millis() as u64,
            )
            .ok();

        let recommendations = match meta::parse_recommendations(&result.text) {
            Ok(recs) => recs,
            Err(e) => {
                let _ = self.record_failure(
                    task,
                    batch_id,
                    ErrorCategory::Planning,
                    &format!("unparseable meta recommendations: {e}"),
                    summary,
                );
                return;
            }
        };

        let (accepted, rejected) = meta::validate(recommendations, &self.board);
        for rejection in &rejected {
            tracing::info!(task_id = %task.id, rejection, "meta recommendation rejected");
        }
        self.apply_recommendations(&accepted);

        let _ = self.board.update_status(task.id, TaskStatus::Complete, None);
        let _ = self.recovery.mark_task_completed(&CompletedTaskState {
            task_id: task.id,
            batch_id,
            status: TaskStatus::Complete,
            error: None,
            error_message: None,
            modified_files: Vec::new(),
            merged_sha: None,
            finished_at: Utc::now(),
        });
        let _ = self.events.append(&Event::TaskComplete {
            task_id: task.id,
            batch_id,
            duration_ms: result.duration.as_millis() as u64,
            merged: false,
            at: Utc::now(),
        });
        summary.completed += 1;
        tracing::info!(
            task_id = %task.id,
            applied = accepted.len(),
            rejected = rejected.len(),
            "meta task applied"
        );
    }

    fn board_digest(&self) -> String {
        let digest: Vec<serde_json::Value> = self
            .board
            .list(&undercity_state::board::TaskFilter::default())
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "objective": t.objective,
                    "status": t.status,
                    "priority": t.priority,
                    "tags": t.tags,
                })
            })
            .collect();
        serde_json::to_string_pretty(&digest).unwrap_or_else(|_| "[]".into())
    }

    /// Apply validated recommendations. This is the only code path that
    /// mutates the board on an agent's behalf.
    fn apply_recommendations(&mut self, recommendations: &[meta::Recommendation]) {
        for rec in recommendations {
            let applied = match rec.action {
                meta::RecAction::Add => {
                    let objective = rec.objective.clone().unwrap_or_default();
                    let priority = rec.priority.unwrap_or(0);
                    match self.board.add(Task::new(objective.clone(), priority)) {
                        Ok(id) => {
                            let _ = self.events.append(&Event::TaskQueued {
                                task_id: id,
                                objective,
                                priority,
                                at: Utc::now(),
                            });
                            true
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "meta add failed");
                            false
                        }
                    }
                }
                meta::RecAction::Remove => rec
                    .task_id
                    .map(|id| self.board.remove(id).is_ok())
                    .unwrap_or(false),
                meta::RecAction::Prioritize => rec
                    .task_id
                    .zip(rec.priority)
                    .map(|(id, priority)| self.board.set_priority(id, priority).is_ok())
                    .unwrap_or(false),
                meta::RecAction::FixStatus => {
                    let target = rec.task_id.zip(
                        rec.status
                            .as_deref()
                            .and_then(|s| s.parse::<TaskStatus>().ok()),
                    );
                    target
                        .map(|(id, status)| self.board.update_status(id, status, None).is_ok())
                        .unwrap_or(false)
                }
                meta::RecAction::Merge | meta::RecAction::Review => {
                    tracing::info!(
                        task_id = ?rec.task_id,
                        reason = rec.reason.as_deref().unwrap_or(""),
                        action = ?rec.action,
                        "advisory recommendation surfaced to operator"
                    );
                    true
                }
            };
            if !applied {
                tracing::warn!(action = ?rec.action, "recommendation could not be applied");
            }
        }
    }
}
