//! Checkpoint-based worker liveness monitoring.
//!
//! A periodic tick walks every `active/` record, compares the task's
//! checkpoint mtime against the stuck threshold, and escalates in three
//! steps: deliver a resume hint through the worker's nudge channel, then
//! cancel the worker cooperatively, then (after a grace period with no
//! terminal record) write the stuck completion record itself.
//!
//! The monitor only ever reads recovery files. Checkpoints stay
//! single-writer: a worker whose checkpoint advanced since the last tick
//! is never touched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use undercity_state::models::{CompletedTaskState, ErrorCategory, TaskStatus};
use undercity_state::recovery::RecoveryStore;

/// In-memory handle to a spawned worker, registered by the orchestrator.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub task_id: Uuid,
    pub batch_id: Uuid,
    /// Resume hints are folded into the worker's next prompt.
    pub nudge: tokio::sync::mpsc::Sender<String>,
    /// Cooperative kill switch for this worker only.
    pub cancel: CancellationToken,
}

/// Shared registry of live worker handles.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<HashMap<Uuid, WorkerHandle>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: WorkerHandle) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.task_id, handle);
    }

    pub fn unregister(&self, task_id: Uuid) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    pub fn get(&self, task_id: Uuid) -> Option<WorkerHandle> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval between ticks.
    pub tick: Duration,
    /// Checkpoint silence after which a worker counts as stuck.
    pub stuck_threshold: Duration,
    /// Resume hints delivered before the worker is killed.
    pub max_recovery_attempts: u32,
    /// Wait after cancellation before the monitor writes the stuck
    /// record itself.
    pub kill_grace: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(300),
            max_recovery_attempts: 1,
            kill_grace: Duration::from_secs(30),
        }
    }
}

/// What the monitor did to a task on one tick (returned for tests and
/// logging).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    Nudged(Uuid),
    Cancelled(Uuid),
    MarkedStuck(Uuid),
}

/// The periodic liveness monitor.
pub struct HealthMonitor {
    store: RecoveryStore,
    registry: WorkerRegistry,
    config: HealthMonitorConfig,
    /// Per-task recovery interventions delivered so far.
    recovery_attempts: HashMap<Uuid, u32>,
    /// Checkpoint mtime observed on the previous tick.
    last_seen: HashMap<Uuid, SystemTime>,
    /// When each task was cancelled, for the kill grace period.
    cancelled_at: HashMap<Uuid, SystemTime>,
}

impl HealthMonitor {
    pub fn new(store: RecoveryStore, registry: WorkerRegistry, config: HealthMonitorConfig) -> Self {
        Self {
            store,
            registry,
            config,
            recovery_attempts: HashMap::new(),
            last_seen: HashMap::new(),
            cancelled_at: HashMap::new(),
        }
    }

    /// Spawn the periodic loop. Returns the join handle and a token that
    /// stops the monitor.
    pub fn spawn(mut self) -> (tokio::task::JoinHandle<()>, CancellationToken) {
        let stop = CancellationToken::new();
        let stop_clone = stop.clone();
        let tick = self.config.tick;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_clone.cancelled() => break,
                    _ = interval.tick() => {
                        let actions = self.check_once().await;
                        for action in &actions {
                            tracing::debug!(?action, "health monitor action");
                        }
                    }
                }
            }
        });
        (handle, stop)
    }

    /// One monitoring pass over all active tasks.
    pub async fn check_once(&mut self) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        let active = match self.store.scan_active_tasks() {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!(error = %e, "health monitor failed to scan active tasks");
                return actions;
            }
        };

        let now = SystemTime::now();
        for task in active {
            if let Some(action) = self.check_task(task.task_id, task.batch_id, now).await {
                actions.push(action);
            }
        }
        actions
    }

    async fn check_task(
        &mut self,
        task_id: Uuid,
        batch_id: Uuid,
        now: SystemTime,
    ) -> Option<HealthAction> {
        // Already cancelled: wait out the grace period, then take over.
        if let Some(cancelled_at) = self.cancelled_at.get(&task_id) {
            let elapsed = now.duration_since(*cancelled_at).unwrap_or_default();
            if elapsed < self.config.kill_grace {
                return None;
            }
            return self.mark_stuck(task_id, batch_id);
        }

        let checkpoint = self.store.read_checkpoint(task_id).ok().flatten();
        let mtime = self.store.checkpoint_mtime(task_id).ok().flatten();

        // No checkpoint yet: the worker has not reached its first phase
        // boundary. Leave it alone; worktree creation and the first agent
        // call can legitimately take a while.
        let (checkpoint, mtime) = match (checkpoint, mtime) {
            (Some(c), Some(m)) => (c, m),
            _ => return None,
        };

        // Progress since the last tick always resets suspicion.
        let advanced = self
            .last_seen
            .get(&task_id)
            .is_none_or(|prev| mtime > *prev);
        self.last_seen.insert(task_id, mtime);
        if advanced {
            return None;
        }

        if !checkpoint.phase.is_stuck_eligible() {
            return None;
        }

        let staleness = now.duration_since(mtime).unwrap_or_default();
        if staleness <= self.config.stuck_threshold {
            return None;
        }

        let handle = self.registry.get(task_id);
        let attempts = self.recovery_attempts.entry(task_id).or_insert(0);

        if *attempts < self.config.max_recovery_attempts {
            *attempts += 1;
            if let Some(handle) = &handle {
                let hint = format!(
                    "No progress recorded for {}s while in phase '{}'. \
                     Resume from the last step: {}",
                    staleness.as_secs(),
                    checkpoint.phase,
                    checkpoint.last_step
                );
                let _ = handle.nudge.try_send(hint);
            }
            tracing::warn!(
                task_id = %task_id,
                phase = %checkpoint.phase,
                staleness_secs = staleness.as_secs(),
                "stuck worker, delivered resume hint"
            );
            return Some(HealthAction::Nudged(task_id));
        }

        if let Some(handle) = handle {
            handle.cancel.cancel();
            self.cancelled_at.insert(task_id, now);
            tracing::warn!(task_id = %task_id, "stuck worker cancelled");
            return Some(HealthAction::Cancelled(task_id));
        }

        // No live handle (e.g. worker crashed without cleanup): take over
        // directly.
        self.mark_stuck(task_id, batch_id)
    }

    fn mark_stuck(&mut self, task_id: Uuid, batch_id: Uuid) -> Option<HealthAction> {
        self.cancelled_at.remove(&task_id);
        self.recovery_attempts.remove(&task_id);

        // The worker may have reached a terminal state during the grace
        // period; scan_active_tasks resolves that in favor of completed.
        let still_active = self
            .store
            .scan_active_tasks()
            .ok()?
            .iter()
            .any(|t| t.task_id == task_id);
        if !still_active {
            return None;
        }

        let record = CompletedTaskState {
            task_id,
            batch_id,
            status: TaskStatus::Failed,
            error: Some(ErrorCategory::Stuck),
            error_message: Some("worker made no checkpoint progress and was terminated".into()),
            modified_files: Vec::new(),
            merged_sha: None,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.store.mark_task_completed(&record) {
            tracing::error!(task_id = %task_id, error = %e, "failed to record stuck task");
            return None;
        }
        self.registry.unregister(task_id);
        tracing::warn!(task_id = %task_id, "stuck worker terminated and recorded");
        Some(HealthAction::MarkedStuck(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use undercity_state::layout::StateLayout;
    use undercity_state::models::{ActiveTaskState, Checkpoint, ModelTier, WorkerPhase};

    fn store() -> (tempfile::TempDir, RecoveryStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = StateLayout::for_project(dir.path());
        let store = RecoveryStore::open(&layout).unwrap();
        (dir, store)
    }

    fn activate(store: &RecoveryStore, task_id: Uuid, batch_id: Uuid) {
        store
            .write_active_task(&ActiveTaskState {
                task_id,
                batch_id,
                objective: "obj".into(),
                status: TaskStatus::InProgress,
                branch: format!("undercity/{task_id}"),
                worktree_path: None,
                model: ModelTier::Sonnet,
                started_at: Utc::now(),
            })
            .unwrap();
    }

    fn checkpoint(store: &RecoveryStore, task_id: Uuid, phase: WorkerPhase) {
        store
            .write_checkpoint(&Checkpoint {
                task_id,
                phase,
                tier: ModelTier::Sonnet,
                attempt: 1,
                tier_attempt: 0,
                last_step: "executing".into(),
                files_touched: vec![],
                last_error: None,
                resume_context: None,
                updated_at: Utc::now(),
            })
            .unwrap();
    }

    fn config() -> HealthMonitorConfig {
        HealthMonitorConfig {
            tick: Duration::from_millis(10),
            stuck_threshold: Duration::from_millis(0),
            max_recovery_attempts: 1,
            kill_grace: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn fresh_checkpoint_is_left_alone() {
        let (_dir, store) = store();
        let registry = WorkerRegistry::new();
        let task_id = Uuid::new_v4();
        activate(&store, task_id, Uuid::new_v4());
        checkpoint(&store, task_id, WorkerPhase::Execute);

        let mut monitor = HealthMonitor::new(
            store,
            registry,
            HealthMonitorConfig {
                stuck_threshold: Duration::from_secs(600),
                ..config()
            },
        );
        // First tick records the mtime; second confirms no action while
        // fresh.
        monitor.check_once().await;
        assert!(monitor.check_once().await.is_empty());
    }

    #[tokio::test]
    async fn stuck_worker_is_nudged_then_cancelled_then_marked() {
        let (_dir, store) = store();
        let registry = WorkerRegistry::new();
        let task_id = Uuid::new_v4();
        let batch_id = Uuid::new_v4();
        activate(&store, task_id, batch_id);
        checkpoint(&store, task_id, WorkerPhase::Execute);

        let (nudge_tx, mut nudge_rx) = tokio::sync::mpsc::channel(4);
        let cancel = CancellationToken::new();
        registry.register(WorkerHandle {
            task_id,
            batch_id,
            nudge: nudge_tx,
            cancel: cancel.clone(),
        });

        let mut monitor = HealthMonitor::new(store.clone(), registry.clone(), config());

        // Tick 1 records the mtime (no prior observation -> counted as
        // progress). Tick 2: no advance -> nudge.
        monitor.check_once().await;
        let actions = monitor.check_once().await;
        assert_eq!(actions, vec![HealthAction::Nudged(task_id)]);
        let hint = nudge_rx.recv().await.unwrap();
        assert!(hint.contains("execute"));
        assert!(!cancel.is_cancelled());

        // Tick 3: recovery attempts exhausted -> cancel.
        let actions = monitor.check_once().await;
        assert_eq!(actions, vec![HealthAction::Cancelled(task_id)]);
        assert!(cancel.is_cancelled());

        // Tick 4: grace elapsed, still active -> stuck record written.
        let actions = monitor.check_once().await;
        assert_eq!(actions, vec![HealthAction::MarkedStuck(task_id)]);

        let completed = store.get_completed_tasks().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, TaskStatus::Failed);
        assert_eq!(completed[0].error, Some(ErrorCategory::Stuck));
        assert!(store.scan_active_tasks().unwrap().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn advancing_checkpoint_resets_suspicion() {
        let (_dir, store) = store();
        let registry = WorkerRegistry::new();
        let task_id = Uuid::new_v4();
        activate(&store, task_id, Uuid::new_v4());
        checkpoint(&store, task_id, WorkerPhase::Execute);

        let mut monitor = HealthMonitor::new(store.clone(), registry, config());
        monitor.check_once().await;

        // The worker writes a fresh checkpoint between ticks.
        tokio::time::sleep(Duration::from_millis(20)).await;
        checkpoint(&store, task_id, WorkerPhase::Verify);

        let actions = monitor.check_once().await;
        assert!(actions.is_empty(), "advanced checkpoint must never be killed");
    }

    #[tokio::test]
    async fn plan_phase_is_not_stuck_eligible() {
        let (_dir, store) = store();
        let registry = WorkerRegistry::new();
        let task_id = Uuid::new_v4();
        activate(&store, task_id, Uuid::new_v4());
        checkpoint(&store, task_id, WorkerPhase::Plan);

        let mut monitor = HealthMonitor::new(store, registry, config());
        monitor.check_once().await;
        assert!(monitor.check_once().await.is_empty());
    }

    #[tokio::test]
    async fn worker_without_handle_is_marked_directly() {
        let (_dir, store) = store();
        let registry = WorkerRegistry::new();
        let task_id = Uuid::new_v4();
        let batch_id = Uuid::new_v4();
        activate(&store, task_id, batch_id);
        checkpoint(&store, task_id, WorkerPhase::Execute);

        let mut monitor = HealthMonitor::new(
            store.clone(),
            registry,
            HealthMonitorConfig {
                max_recovery_attempts: 0,
                ..config()
            },
        );
        monitor.check_once().await;
        let actions = monitor.check_once().await;
        assert_eq!(actions, vec![HealthAction::MarkedStuck(task_id)]);
        assert_eq!(store.get_completed_tasks().unwrap().len(), 1);
    }
}
