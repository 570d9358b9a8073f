//! Merge pipeline tests against real git repositories: fast-forward
//! landings, serial linear history, rebase conflicts, and the
//! post-rebase verify-and-fix loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use undercity_core::git;
use undercity_core::merge::{MergeCandidate, MergeConfig, MergePipeline};
use undercity_core::verify::{VerifyCommand, VerifyRunner};
use undercity_core::worktree::{WorktreeInfo, WorktreeManager};
use undercity_state::models::{ErrorCategory, VerifyKind};
use undercity_test_utils::{run_git, ScriptedAgent, TempRepo};

struct Harness {
    repo: TempRepo,
    _worktree_base: tempfile::TempDir,
    manager: WorktreeManager,
}

impl Harness {
    fn new() -> Self {
        let repo = TempRepo::new();
        let worktree_base = tempfile::TempDir::new().unwrap();
        let manager =
            WorktreeManager::new(&repo.path, Some(worktree_base.path().to_path_buf())).unwrap();
        Self {
            repo,
            _worktree_base: worktree_base,
            manager,
        }
    }

    /// Create a worktree and commit one file change in it.
    fn branch_with_change(&self, rel_path: &str, contents: &str) -> WorktreeInfo {
        let info = self.manager.create_worktree(Uuid::new_v4()).unwrap();
        let file = info.path.join(rel_path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&file, contents).unwrap();
        run_git(&info.path, &["add", "."]);
        run_git(&info.path, &["commit", "-m", "agent change"]);
        info
    }

    fn pipeline(&self, verify: VerifyRunner, agent: Arc<ScriptedAgent>) -> MergePipeline {
        MergePipeline::new(
            self.manager.clone(),
            verify,
            agent,
            MergeConfig {
                fix_timeout: Duration::from_secs(10),
                ..MergeConfig::default()
            },
        )
    }

    fn candidate(&self, info: &WorktreeInfo, parent_id: Option<Uuid>) -> MergeCandidate {
        MergeCandidate {
            task_id: info.task_id,
            parent_id,
            branch: info.branch.clone(),
            worktree_path: info.path.clone(),
        }
    }
}

fn no_verify() -> VerifyRunner {
    VerifyRunner::with_commands(vec![])
}

fn marker_verify() -> VerifyRunner {
    VerifyRunner::with_commands(vec![VerifyCommand {
        project_type: "test".into(),
        kind: VerifyKind::Test,
        command: "test".into(),
        args: vec!["-f".into(), "required.marker".into()],
    }])
    .with_timeout(Duration::from_secs(10))
}

// ===========================================================================

#[tokio::test]
async fn single_branch_fast_forwards() {
    let harness = Harness::new();
    let before = harness.repo.commit_count();
    let info = harness.branch_with_change("feature.txt", "new feature\n");

    let pipeline = harness.pipeline(no_verify(), Arc::new(ScriptedAgent::always("")));
    let outcomes = pipeline
        .merge_batch(vec![harness.candidate(&info, None)])
        .await;

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success, "{:?}", outcomes[0]);
    assert_eq!(
        outcomes[0].merged_sha.as_deref(),
        Some(harness.repo.head_sha().as_str())
    );
    assert_eq!(harness.repo.commit_count(), before + 1);
    assert!(harness.repo.file_exists("feature.txt"));
}

#[tokio::test]
async fn disjoint_branches_land_serially_and_linearly() {
    let harness = Harness::new();
    let before = harness.repo.commit_count();
    let a = harness.branch_with_change("a.rs", "pub fn a() {}\n");
    let b = harness.branch_with_change("b.rs", "pub fn b() {}\n");

    let pipeline = harness.pipeline(no_verify(), Arc::new(ScriptedAgent::always("")));
    let outcomes = pipeline
        .merge_batch(vec![
            harness.candidate(&a, None),
            harness.candidate(&b, None),
        ])
        .await;

    assert!(outcomes.iter().all(|o| o.success), "{outcomes:?}");
    assert_eq!(harness.repo.commit_count(), before + 2);
    assert!(harness.repo.file_exists("a.rs") && harness.repo.file_exists("b.rs"));

    // Strictly linear mainline: every commit has at most one parent.
    let merges = undercity_test_utils::output_git(
        &harness.repo.path,
        &["rev-list", "--merges", "HEAD"],
    );
    assert!(merges.is_empty(), "history must be linear, found merges: {merges}");
}

#[tokio::test]
async fn conflicting_branch_fails_with_rebase_conflict() {
    let harness = Harness::new();
    // Both branches rewrite README.md with different content.
    let a = harness.branch_with_change("README.md", "version A\n");
    let b = harness.branch_with_change("README.md", "version B\n");

    let pipeline = harness.pipeline(no_verify(), Arc::new(ScriptedAgent::always("")));
    let outcomes = pipeline
        .merge_batch(vec![
            harness.candidate(&a, None),
            harness.candidate(&b, None),
        ])
        .await;

    let successes: Vec<_> = outcomes.iter().filter(|o| o.success).collect();
    let failures: Vec<_> = outcomes.iter().filter(|o| !o.success).collect();
    assert_eq!(successes.len(), 1);
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].category,
        Some(ErrorCategory::RebaseConflict),
        "{failures:?}"
    );
    // The failed worktree was left rebase-aborted, not mid-rebase.
    let loser = if successes[0].task_id == a.task_id { &b } else { &a };
    let status = git::git(&loser.path, &["status", "--porcelain"]).unwrap();
    assert!(!status.contains("UU"), "no unresolved conflict markers: {status}");
}

#[tokio::test]
async fn post_rebase_verify_failure_is_fixed_by_agent() {
    let harness = Harness::new();
    let info = harness.branch_with_change("code.rs", "pub fn f() {}\n");

    // Verification wants required.marker, which the branch lacks. The fix
    // agent writes it; the pipeline commits the repair.
    let agent = Arc::new(ScriptedAgent::new(vec![
        undercity_test_utils::ScriptedResponse::with_effect("wrote the marker", |cwd: &Path| {
            std::fs::write(cwd.join("required.marker"), "ok\n").unwrap();
        }),
    ]));
    let pipeline = harness.pipeline(marker_verify(), Arc::clone(&agent));
    let outcomes = pipeline
        .merge_batch(vec![harness.candidate(&info, None)])
        .await;

    assert!(outcomes[0].success, "{:?}", outcomes[0]);
    assert_eq!(agent.call_count(), 1);
    assert!(harness.repo.file_exists("required.marker"));
}

#[tokio::test]
async fn unfixable_verify_failure_is_terminal_with_kind() {
    let harness = Harness::new();
    let info = harness.branch_with_change("code.rs", "pub fn f() {}\n");

    // The agent never writes the marker.
    let agent = Arc::new(ScriptedAgent::always("could not fix"));
    let pipeline = harness.pipeline(marker_verify(), Arc::clone(&agent));
    let outcomes = pipeline
        .merge_batch(vec![harness.candidate(&info, None)])
        .await;

    assert!(!outcomes[0].success);
    assert_eq!(
        outcomes[0].category,
        Some(ErrorCategory::VerifyFailed(VerifyKind::Test))
    );
    // Bounded agent work: default merge_fix_attempts.
    assert_eq!(agent.call_count(), MergeConfig::default().merge_fix_attempts as usize);
    // Mainline untouched.
    assert!(!harness.repo.file_exists("code.rs"));
}

#[tokio::test]
async fn sibling_conflict_is_labeled() {
    let harness = Harness::new();
    let parent = Uuid::new_v4();
    let a = harness.branch_with_change("shared.txt", "sibling A\n");
    let b = harness.branch_with_change("shared.txt", "sibling B\n");

    let pipeline = harness.pipeline(no_verify(), Arc::new(ScriptedAgent::always("")));
    let outcomes = pipeline
        .merge_batch(vec![
            harness.candidate(&a, Some(parent)),
            harness.candidate(&b, Some(parent)),
        ])
        .await;

    let failure = outcomes.iter().find(|o| !o.success).expect("one must fail");
    assert!(
        failure.sibling_conflict,
        "conflict between siblings should be labeled: {failure:?}"
    );
}

#[tokio::test]
async fn malformed_candidates_fail_without_touching_mainline() {
    let harness = Harness::new();
    let before = harness.repo.head_sha();

    let pipeline = harness.pipeline(no_verify(), Arc::new(ScriptedAgent::always("")));
    let outcomes = pipeline
        .merge_batch(vec![
            MergeCandidate {
                task_id: Uuid::new_v4(),
                parent_id: None,
                branch: "bad name; rm -rf".into(),
                worktree_path: harness.repo.path.clone(),
            },
            MergeCandidate {
                task_id: Uuid::new_v4(),
                parent_id: None,
                branch: "undercity/missing".into(),
                worktree_path: "/does/not/exist".into(),
            },
        ])
        .await;

    assert!(outcomes.iter().all(|o| !o.success));
    assert_eq!(harness.repo.head_sha(), before);
}
