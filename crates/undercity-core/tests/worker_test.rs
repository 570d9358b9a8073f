//! Worker state machine tests: plan sentinels, the fix loop, tier
//! escalation, and checkpoint discipline, driven by scripted agents
//! against real worktrees.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use undercity_core::agent::AgentError;
use undercity_core::orchestrator::budget::OpusBudget;
use undercity_core::verify::{VerifyCommand, VerifyRunner};
use undercity_core::worker::briefing::Briefing;
use undercity_core::worker::{Worker, WorkerConfig, WorkerOutcome};
use undercity_core::worktree::{WorktreeInfo, WorktreeManager};
use undercity_state::layout::StateLayout;
use undercity_state::models::{ErrorCategory, ModelTier, Task, WorkerPhase};
use undercity_state::recovery::RecoveryStore;
use undercity_test_utils::{ScriptedAgent, ScriptedResponse, TempRepo};

struct Harness {
    _repo: TempRepo,
    _worktree_base: tempfile::TempDir,
    _state_dir: tempfile::TempDir,
    store: RecoveryStore,
    info: WorktreeInfo,
    task: Task,
    opus: Arc<Mutex<OpusBudget>>,
}

impl Harness {
    fn new(objective: &str) -> Self {
        let repo = TempRepo::new();
        let worktree_base = tempfile::TempDir::new().unwrap();
        let manager =
            WorktreeManager::new(&repo.path, Some(worktree_base.path().to_path_buf())).unwrap();

        let state_dir = tempfile::TempDir::new().unwrap();
        let layout = StateLayout::for_project(state_dir.path());
        let store = RecoveryStore::open(&layout).unwrap();

        let task = Task::new(objective, 5);
        let info = manager.create_worktree(task.id).unwrap();

        // One task in session -> one opus start allowed.
        let mut budget = OpusBudget::new();
        budget.note_task();

        Self {
            _repo: repo,
            _worktree_base: worktree_base,
            _state_dir: state_dir,
            store,
            info,
            task,
            opus: Arc::new(Mutex::new(budget)),
        }
    }

    fn worker(
        &self,
        agent: Arc<ScriptedAgent>,
        verify: VerifyRunner,
        config: WorkerConfig,
    ) -> Worker {
        let (_nudge_tx, nudge_rx) = tokio::sync::mpsc::channel(4);
        Worker {
            task: self.task.clone(),
            briefing: Briefing::default(),
            worktree_path: self.info.path.clone(),
            base_sha: self.info.base_sha.clone(),
            config,
            runner: agent,
            store: self.store.clone(),
            verify,
            cancel: CancellationToken::new(),
            nudges: nudge_rx,
            opus_budget: Arc::clone(&self.opus),
        }
    }
}

fn no_verify() -> VerifyRunner {
    VerifyRunner::with_commands(vec![])
}

/// Verification that passes iff `fixed.marker` exists in the worktree.
fn marker_verify() -> VerifyRunner {
    VerifyRunner::with_commands(vec![VerifyCommand {
        project_type: "test".into(),
        kind: undercity_state::models::VerifyKind::Test,
        command: "test".into(),
        args: vec!["-f".into(), "fixed.marker".into()],
    }])
    .with_timeout(Duration::from_secs(10))
}

fn config(starting: ModelTier) -> WorkerConfig {
    WorkerConfig {
        starting_tier: starting,
        review_passes: false,
        agent_timeout: Duration::from_secs(10),
        ..WorkerConfig::default()
    }
}

fn write_marker(cwd: &std::path::Path) {
    std::fs::write(cwd.join("fixed.marker"), "ok\n").unwrap();
}

// ===========================================================================

#[tokio::test]
async fn already_complete_plan_terminates_with_zero_changes() {
    let harness = Harness::new("add a function that already exists");
    let agent = Arc::new(ScriptedAgent::always("ALREADY_COMPLETE"));
    let worker = harness.worker(Arc::clone(&agent), no_verify(), config(ModelTier::Sonnet));

    let report = worker.run().await;
    assert_eq!(report.outcome, WorkerOutcome::Complete { zero_change: true });
    assert!(report.modified_files.is_empty());
    assert_eq!(agent.call_count(), 1, "no execute after the refusal");

    let checkpoint = harness.store.read_checkpoint(harness.task.id).unwrap().unwrap();
    assert_eq!(checkpoint.phase, WorkerPhase::Done);
}

#[tokio::test]
async fn needs_decomposition_yields_subtask_objectives() {
    let harness = Harness::new("build the whole subsystem");
    let agent = Arc::new(ScriptedAgent::always(
        "This is too big.\nNEEDS_DECOMPOSITION\n- build the data model\n- build the api surface\n",
    ));
    let worker = harness.worker(agent, no_verify(), config(ModelTier::Sonnet));

    let report = worker.run().await;
    match report.outcome {
        WorkerOutcome::Decompose { subtask_objectives } => {
            assert_eq!(
                subtask_objectives,
                vec!["build the data model", "build the api surface"]
            );
        }
        other => panic!("expected Decompose, got {other:?}"),
    }
}

#[tokio::test]
async fn plan_rejection_fails_with_planning_category() {
    let harness = Harness::new("do something incoherent");
    let agent = Arc::new(ScriptedAgent::always(
        "PLAN_REJECTED\nthe objective contradicts itself",
    ));
    let worker = harness.worker(agent, no_verify(), config(ModelTier::Sonnet));

    let report = worker.run().await;
    match report.outcome {
        WorkerOutcome::Failed { category, .. } => {
            assert_eq!(category, ErrorCategory::Planning);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn clean_run_commits_the_change() {
    let harness = Harness::new("write the greeting module");
    let agent = Arc::new(ScriptedAgent::new(vec![
        ScriptedResponse::text("1. add greeting.rs"),
        ScriptedResponse::with_effect("done", |cwd| {
            std::fs::write(cwd.join("greeting.rs"), "pub fn hi() {}\n").unwrap();
        }),
    ]));
    let worker = harness.worker(agent, no_verify(), config(ModelTier::Sonnet));

    let report = worker.run().await;
    assert_eq!(report.outcome, WorkerOutcome::Complete { zero_change: false });
    assert!(report.modified_files.contains(&"greeting.rs".to_owned()));
    assert_eq!(report.tier, ModelTier::Sonnet);

    // Auto-commit left a clean worktree with the change on the branch.
    let status = undercity_core::git::git(&harness.info.path, &["status", "--porcelain"]).unwrap();
    assert!(status.trim().is_empty(), "worktree should be clean: {status}");
    let subject =
        undercity_core::git::git(&harness.info.path, &["log", "-1", "--format=%s"]).unwrap();
    assert!(subject.starts_with("undercity:"), "got subject {subject:?}");
}

#[tokio::test]
async fn verify_failures_burn_tier_retries_then_escalate_to_opus() {
    let harness = Harness::new("make the marker test pass");
    // plan, execute (no effect), three failed fixes at sonnet, then the
    // opus execute writes the marker.
    let agent = Arc::new(ScriptedAgent::new(vec![
        ScriptedResponse::text("1. create fixed.marker"),
        ScriptedResponse::text("tried"),
        ScriptedResponse::text("fix one"),
        ScriptedResponse::text("fix two"),
        ScriptedResponse::text("fix three"),
        ScriptedResponse::with_effect("created at opus", write_marker),
    ]));
    let worker = harness.worker(
        Arc::clone(&agent),
        marker_verify(),
        WorkerConfig {
            max_retries_per_tier: 3,
            ..config(ModelTier::Sonnet)
        },
    );

    let report = worker.run().await;
    assert_eq!(report.outcome, WorkerOutcome::Complete { zero_change: false });
    assert_eq!(report.tier, ModelTier::Opus);
    assert!(report.escalated_to_opus);
    assert_eq!(
        harness
            .opus
            .lock()
            .unwrap()
            .opus_started(),
        1,
        "escalation consumed the opus budget"
    );
    // 1 execute + 3 fixes at sonnet, 1 execute at opus.
    assert_eq!(report.attempts, 5);
}

#[tokio::test]
async fn tier_cap_exhaustion_is_terminal() {
    let harness = Harness::new("make the marker test pass");
    let agent = Arc::new(ScriptedAgent::always("still trying"));
    let worker = harness.worker(
        agent,
        marker_verify(),
        WorkerConfig {
            max_tier: ModelTier::Sonnet,
            max_retries_per_tier: 1,
            ..config(ModelTier::Sonnet)
        },
    );

    let report = worker.run().await;
    match report.outcome {
        WorkerOutcome::Failed { category, message } => {
            assert_eq!(category, ErrorCategory::TierCapExhausted);
            assert!(message.contains("sonnet"), "message: {message}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn opus_budget_denial_fails_with_budget_category() {
    let harness = Harness::new("make the marker test pass");
    // Fresh budget with zero processed tasks: no opus allowance.
    *harness.opus.lock().unwrap() = OpusBudget::new();

    let agent = Arc::new(ScriptedAgent::always("no progress"));
    let worker = harness.worker(
        agent,
        marker_verify(),
        WorkerConfig {
            max_retries_per_tier: 1,
            ..config(ModelTier::Sonnet)
        },
    );

    let report = worker.run().await;
    match report.outcome {
        WorkerOutcome::Failed { category, .. } => {
            assert_eq!(category, ErrorCategory::BudgetExceeded);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limit_error_is_terminal_and_categorized() {
    let harness = Harness::new("anything");
    let agent = Arc::new(ScriptedAgent::new(vec![ScriptedResponse::error(|| {
        AgentError::RateLimited("429".into())
    })]));
    let worker = harness.worker(agent, no_verify(), config(ModelTier::Sonnet));

    let report = worker.run().await;
    match report.outcome {
        WorkerOutcome::Failed { category, .. } => {
            assert_eq!(category, ErrorCategory::RateLimited);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn review_blocking_issue_routes_through_fix() {
    let harness = Harness::new("write the greeting module");
    let reviewed_fix = "fixed the blocking issue";
    let agent = Arc::new(ScriptedAgent::new(vec![
        ScriptedResponse::text("1. add greeting.rs"),
        ScriptedResponse::with_effect("done", |cwd| {
            std::fs::write(cwd.join("greeting.rs"), "pub fn hi() {}\n").unwrap();
        }),
        ScriptedResponse::text("BLOCKING: greeting is misspelled"),
        ScriptedResponse::with_effect(reviewed_fix, |cwd| {
            std::fs::write(cwd.join("greeting.rs"), "pub fn hello() {}\n").unwrap();
        }),
        ScriptedResponse::text("LGTM"),
    ]));
    let worker = harness.worker(
        Arc::clone(&agent),
        no_verify(),
        WorkerConfig {
            review_passes: true,
            max_review_passes_per_tier: 2,
            ..config(ModelTier::Sonnet)
        },
    );

    let report = worker.run().await;
    assert_eq!(report.outcome, WorkerOutcome::Complete { zero_change: false });
    // plan, execute, review (blocking), fix, review (LGTM).
    assert_eq!(agent.call_count(), 5);
    let content = std::fs::read_to_string(harness.info.path.join("greeting.rs")).unwrap();
    assert!(content.contains("hello"));
}

#[tokio::test]
async fn checkpoints_advance_through_phases() {
    let harness = Harness::new("write a file");
    let agent = Arc::new(ScriptedAgent::new(vec![
        ScriptedResponse::text("1. write"),
        ScriptedResponse::with_effect("done", |cwd| {
            std::fs::write(cwd.join("out.txt"), "x\n").unwrap();
        }),
    ]));
    let worker = harness.worker(agent, no_verify(), config(ModelTier::Sonnet));

    let report = worker.run().await;
    assert!(matches!(report.outcome, WorkerOutcome::Complete { .. }));

    let checkpoint = harness.store.read_checkpoint(harness.task.id).unwrap().unwrap();
    assert_eq!(checkpoint.phase, WorkerPhase::Done);
    assert_eq!(checkpoint.tier, ModelTier::Sonnet);
    assert!(checkpoint.files_touched.contains(&"out.txt".to_owned()));
}

#[tokio::test]
async fn cancelled_worker_reports_stuck() {
    let harness = Harness::new("anything");
    let agent = Arc::new(ScriptedAgent::always("plan"));
    let mut worker = harness.worker(agent, no_verify(), config(ModelTier::Sonnet));
    worker.cancel = {
        let token = CancellationToken::new();
        token.cancel();
        token
    };

    let report = worker.run().await;
    match report.outcome {
        WorkerOutcome::Failed { category, .. } => assert_eq!(category, ErrorCategory::Stuck),
        other => panic!("expected Failed, got {other:?}"),
    }
}
