//! Stuck-worker supervision: a worker whose checkpoint stops advancing
//! during execute is nudged, then cancelled, and its task is recorded as
//! failed/stuck.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use undercity_core::agent::{AgentError, AgentRequest, AgentResult, AgentRunner};
use undercity_core::health::{HealthMonitor, HealthMonitorConfig, WorkerHandle, WorkerRegistry};
use undercity_core::orchestrator::budget::OpusBudget;
use undercity_core::verify::VerifyRunner;
use undercity_core::worker::briefing::Briefing;
use undercity_core::worker::{Worker, WorkerConfig, WorkerOutcome};
use undercity_core::worktree::WorktreeManager;
use undercity_state::layout::StateLayout;
use undercity_state::models::{ActiveTaskState, ErrorCategory, ModelTier, Task, TaskStatus};
use undercity_state::recovery::RecoveryStore;
use undercity_test_utils::TempRepo;

/// Plans instantly, then hangs in execute until cancelled.
struct HangingAgent;

#[async_trait]
impl AgentRunner for HangingAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentResult, AgentError> {
        if request.prompt.contains("Do NOT edit any files yet") {
            return Ok(AgentResult {
                text: "1. do the work".into(),
                input_tokens: 1,
                output_tokens: 1,
                duration: Duration::from_millis(1),
            });
        }
        request.cancel.cancelled().await;
        Err(AgentError::Cancelled)
    }
}

#[tokio::test]
async fn stuck_execute_phase_is_nudged_then_killed() {
    let repo = TempRepo::new();
    let worktree_base = tempfile::TempDir::new().unwrap();
    let manager =
        WorktreeManager::new(&repo.path, Some(worktree_base.path().to_path_buf())).unwrap();

    let state_dir = tempfile::TempDir::new().unwrap();
    let layout = StateLayout::for_project(state_dir.path());
    let store = RecoveryStore::open(&layout).unwrap();

    let task = Task::new("hang forever", 5);
    let batch_id = Uuid::new_v4();
    let info = manager.create_worktree(task.id).unwrap();

    store
        .write_active_task(&ActiveTaskState {
            task_id: task.id,
            batch_id,
            objective: task.objective.clone(),
            status: TaskStatus::InProgress,
            branch: info.branch.clone(),
            worktree_path: Some(info.path.clone()),
            model: ModelTier::Sonnet,
            started_at: Utc::now(),
        })
        .unwrap();

    let registry = WorkerRegistry::new();
    let (nudge_tx, nudge_rx) = tokio::sync::mpsc::channel(4);
    let cancel = CancellationToken::new();
    registry.register(WorkerHandle {
        task_id: task.id,
        batch_id,
        nudge: nudge_tx,
        cancel: cancel.clone(),
    });

    let worker = Worker {
        task: task.clone(),
        briefing: Briefing::default(),
        worktree_path: info.path.clone(),
        base_sha: info.base_sha.clone(),
        config: WorkerConfig {
            starting_tier: ModelTier::Sonnet,
            review_passes: false,
            agent_timeout: Duration::from_secs(60),
            ..WorkerConfig::default()
        },
        runner: Arc::new(HangingAgent),
        store: store.clone(),
        verify: VerifyRunner::with_commands(vec![]),
        cancel,
        nudges: nudge_rx,
        opus_budget: Arc::new(Mutex::new(OpusBudget::new())),
    };
    let worker_handle = tokio::spawn(worker.run());

    // Give the worker time to write its execute checkpoint and hang.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut monitor = HealthMonitor::new(
        store.clone(),
        registry.clone(),
        HealthMonitorConfig {
            tick: Duration::from_millis(20),
            stuck_threshold: Duration::from_millis(0),
            max_recovery_attempts: 1,
            kill_grace: Duration::from_millis(50),
        },
    );

    // Tick until the monitor cancels the worker (baseline, nudge,
    // cancel).
    let mut cancelled = false;
    for _ in 0..10 {
        let actions = monitor.check_once().await;
        if actions
            .iter()
            .any(|a| matches!(a, undercity_core::health::HealthAction::Cancelled(_)))
        {
            cancelled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(cancelled, "monitor must cancel the hung worker");

    // The worker observes the cancellation and reports stuck.
    let report = worker_handle.await.unwrap();
    match report.outcome {
        WorkerOutcome::Failed { category, .. } => {
            assert_eq!(category, ErrorCategory::Stuck);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}
