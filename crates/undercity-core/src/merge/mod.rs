//! The serial merge pipeline.
//!
//! Successful worker branches land on mainline one at a time:
//! rebase onto the latest mainline, re-verify (with bounded agent-driven
//! fix attempts), then fast-forward merge. Only this pipeline ever
//! mutates the main checkout; the conceptual merge token is the
//! pipeline's own serial loop.
//!
//! Candidates are ordered by parent group (orphans first, then each
//! parent's siblings together) and retried across passes: any success
//! changes the conflict landscape, so failures from one pass are worth a
//! second look. The retry loop stops when a pass makes no progress.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use undercity_state::models::{ErrorCategory, ModelTier, VerifyKind};

use crate::agent::{AgentRequest, AgentRunner};
use crate::git;
use crate::verify::VerifyRunner;
use crate::worker::prompts;
use crate::worktree::{validate_ref, WorktreeManager};

/// Merge pipeline tuning.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Re-fetch/re-rebase attempts when a fast-forward is refused
    /// because mainline moved.
    pub max_merge_retries: u32,
    /// Agent fix invocations per merge attempt when post-rebase
    /// verification fails. The product of these two knobs bounds total
    /// agent work per candidate.
    pub merge_fix_attempts: u32,
    /// Model tier for merge-fix invocations.
    pub fix_tier: ModelTier,
    pub fix_timeout: Duration,
    /// Push mainline to `remote` after a successful merge.
    pub push_on_success: bool,
    pub remote: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_merge_retries: 3,
            merge_fix_attempts: 2,
            fix_tier: ModelTier::Sonnet,
            fix_timeout: Duration::from_secs(600),
            push_on_success: false,
            remote: "origin".into(),
        }
    }
}

/// One branch queued for merging.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub task_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub branch: String,
    pub worktree_path: PathBuf,
}

/// Result of one candidate's trip through the pipeline.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub task_id: Uuid,
    pub success: bool,
    pub category: Option<ErrorCategory>,
    pub message: Option<String>,
    /// Mainline SHA after a successful merge.
    pub merged_sha: Option<String>,
    /// Whether the failure collided with an already-merged sibling
    /// (decomposition-quality analytics).
    pub sibling_conflict: bool,
}

impl MergeOutcome {
    fn success(task_id: Uuid, sha: String) -> Self {
        Self {
            task_id,
            success: true,
            category: None,
            message: None,
            merged_sha: Some(sha),
            sibling_conflict: false,
        }
    }

    fn failure(task_id: Uuid, category: ErrorCategory, message: String) -> Self {
        Self {
            task_id,
            success: false,
            category: Some(category),
            message: Some(message),
            merged_sha: None,
            sibling_conflict: false,
        }
    }
}

/// The serial merge pipeline.
pub struct MergePipeline {
    worktrees: WorktreeManager,
    verify: VerifyRunner,
    runner: Arc<dyn AgentRunner>,
    config: MergeConfig,
}

impl MergePipeline {
    pub fn new(
        worktrees: WorktreeManager,
        verify: VerifyRunner,
        runner: Arc<dyn AgentRunner>,
        config: MergeConfig,
    ) -> Self {
        Self {
            worktrees,
            verify,
            runner,
            config,
        }
    }

    /// Merge a batch of candidates. Failures never cascade: each
    /// candidate gets its own outcome and peers continue.
    pub async fn merge_batch(&self, candidates: Vec<MergeCandidate>) -> Vec<MergeOutcome> {
        let mut ordered = order_by_parent_group(candidates);
        let mut outcomes: BTreeMap<Uuid, MergeOutcome> = BTreeMap::new();
        let mut merged_siblings: Vec<Option<Uuid>> = Vec::new();

        // Multi-pass: retry failures as long as some peer merged in the
        // previous pass.
        loop {
            let mut next_round = Vec::new();
            let mut progressed = false;

            for candidate in ordered {
                let had_merged_sibling = candidate.parent_id.is_some()
                    && merged_siblings.contains(&candidate.parent_id);

                let mut outcome = self.merge_one(&candidate).await;
                if !outcome.success
                    && matches!(outcome.category, Some(ErrorCategory::RebaseConflict))
                {
                    outcome.sibling_conflict = had_merged_sibling;
                }

                if outcome.success {
                    progressed = true;
                    merged_siblings.push(candidate.parent_id);
                    tracing::info!(
                        task_id = %candidate.task_id,
                        sha = outcome.merged_sha.as_deref().unwrap_or(""),
                        "merged into mainline"
                    );
                } else {
                    tracing::warn!(
                        task_id = %candidate.task_id,
                        category = ?outcome.category,
                        sibling_conflict = outcome.sibling_conflict,
                        "merge failed"
                    );
                    next_round.push(candidate.clone());
                }
                outcomes.insert(candidate.task_id, outcome);
            }

            if next_round.is_empty() || !progressed {
                break;
            }
            tracing::info!(
                retrying = next_round.len(),
                "re-attempting failed merges after peer progress"
            );
            ordered = next_round;
        }

        outcomes.into_values().collect()
    }

    /// One candidate: validate, clean, fetch, rebase, verify(+fix), ff.
    async fn merge_one(&self, candidate: &MergeCandidate) -> MergeOutcome {
        let task_id = candidate.task_id;

        // 1. Validate.
        if candidate.branch.is_empty() || validate_ref(&candidate.branch).is_err() {
            return MergeOutcome::failure(
                task_id,
                ErrorCategory::Internal,
                format!("malformed branch name {:?}", candidate.branch),
            );
        }
        if !candidate.worktree_path.is_dir() {
            return MergeOutcome::failure(
                task_id,
                ErrorCategory::Internal,
                format!("worktree missing at {}", candidate.worktree_path.display()),
            );
        }
        let wt = &candidate.worktree_path;
        let main_repo = self.worktrees.main_repo_path().to_path_buf();
        let main_branch = self.worktrees.main_branch().to_owned();

        // 2. Discard tracked noise; keep untracked files (they may be the
        // agent's scratch notes and cost nothing).
        if let Err(e) = git::git(wt, &["checkout", "--", "."]) {
            tracing::warn!(task_id = %task_id, error = %e, "failed to clean worktree");
        }

        let mut ff_attempts = 0u32;
        loop {
            // 3. Bring mainline into the worktree as FETCH_HEAD. The
            // worktree shares the object store, so fetching from "." is a
            // ref update, not a transfer.
            if let Err(e) = git::git(wt, &["fetch", ".", &main_branch]) {
                return MergeOutcome::failure(
                    task_id,
                    ErrorCategory::Internal,
                    format!("fetch of mainline failed: {e}"),
                );
            }

            // 4. Rebase onto it.
            if let Err(e) = git::git(wt, &["rebase", "FETCH_HEAD"]) {
                let _ = git::git(wt, &["rebase", "--abort"]);
                return MergeOutcome::failure(
                    task_id,
                    ErrorCategory::RebaseConflict,
                    format!("rebase onto {main_branch} conflicted: {e}"),
                );
            }

            // 5. Post-rebase verification, with bounded agent fixes.
            match self.verify_with_fixes(candidate).await {
                Ok(()) => {}
                Err((category, message)) => {
                    return MergeOutcome::failure(task_id, category, message);
                }
            }

            // 6. Fast-forward mainline in the main repo.
            match git::git(&main_repo, &["merge", "--ff-only", &candidate.branch]) {
                Ok(_) => break,
                Err(e) => {
                    ff_attempts += 1;
                    if ff_attempts >= self.config.max_merge_retries {
                        return MergeOutcome::failure(
                            task_id,
                            ErrorCategory::FfFailed,
                            format!(
                                "fast-forward refused after {ff_attempts} attempts: {e}"
                            ),
                        );
                    }
                    // Mainline moved under us (a peer merged). Re-fetch
                    // and re-rebase.
                    tracing::info!(
                        task_id = %task_id,
                        attempt = ff_attempts,
                        "fast-forward refused, re-rebasing"
                    );
                }
            }
        }

        let sha = match git::git(&main_repo, &["rev-parse", "HEAD"]) {
            Ok(sha) => sha,
            Err(e) => {
                return MergeOutcome::failure(
                    task_id,
                    ErrorCategory::Internal,
                    format!("merged but could not read mainline SHA: {e}"),
                );
            }
        };

        // 7. Optional push; failure is logged, not fatal to the merge.
        if self.config.push_on_success {
            if let Err(e) = git::git(
                &main_repo,
                &["push", &self.config.remote, &main_branch],
            ) {
                tracing::warn!(error = %e, "push after merge failed");
            }
        }

        MergeOutcome::success(task_id, sha)
    }

    /// Run verification in the worktree; on failure, hand the output to a
    /// short agent invocation and re-verify, up to the configured cap.
    async fn verify_with_fixes(
        &self,
        candidate: &MergeCandidate,
    ) -> Result<(), (ErrorCategory, String)> {
        let wt = &candidate.worktree_path;

        for fix_round in 0..=self.config.merge_fix_attempts {
            let report = self
                .verify
                .run(wt)
                .await
                .map_err(|e| (ErrorCategory::Internal, format!("verify runner failed: {e:#}")))?;

            if report.passed() {
                return Ok(());
            }

            let kind = report.failure_kind().unwrap_or(VerifyKind::Build);
            let summary = report.failure_summary(2048);

            if fix_round == self.config.merge_fix_attempts {
                return Err((
                    ErrorCategory::VerifyFailed(kind),
                    format!("post-rebase verification still failing:\n{summary}"),
                ));
            }

            tracing::info!(
                task_id = %candidate.task_id,
                kind = %kind,
                fix_round = fix_round + 1,
                "post-rebase verification failed, attempting agent fix"
            );
            let request = AgentRequest {
                task_id: candidate.task_id,
                prompt: prompts::merge_fix_prompt(&candidate.branch, &summary),
                tier: self.config.fix_tier,
                cwd: wt.clone(),
                timeout: self.config.fix_timeout,
                cancel: CancellationToken::new(),
            };
            if let Err(e) = self.runner.run(request).await {
                return Err((
                    ErrorCategory::VerifyFailed(kind),
                    format!("merge verification fix agent failed: {e}"),
                ));
            }
            // An uncommitted fix would be lost by the next rebase; fold it
            // into the branch. The assignment marker stays out of history.
            let _ = git::git(wt, &["add", "-A"]);
            let _ = git::git(
                wt,
                &["reset", "-q", "--", undercity_state::layout::ASSIGNMENT_FILE_NAME],
            );
            let committed = git::git(wt, &["diff", "--cached", "--name-only"])
                .map(|staged| !staged.trim().is_empty())
                .unwrap_or(false);
            if committed {
                let _ = git::git(wt, &["commit", "-m", "post-rebase fix", "--no-verify"]);
            }
        }
        Err((
            ErrorCategory::Internal,
            "merge verification loop exited without a verdict".into(),
        ))
    }
}

/// Stable parent-group ordering: orphans first (by task id), then each
/// parent's sibling group together (groups by parent id, members in
/// input order).
pub fn order_by_parent_group(candidates: Vec<MergeCandidate>) -> Vec<MergeCandidate> {
    let mut orphans: Vec<MergeCandidate> = Vec::new();
    let mut groups: BTreeMap<Uuid, Vec<MergeCandidate>> = BTreeMap::new();

    for candidate in candidates {
        match candidate.parent_id {
            None => orphans.push(candidate),
            Some(parent) => groups.entry(parent).or_default().push(candidate),
        }
    }
    orphans.sort_by_key(|c| c.task_id);

    let mut out = orphans;
    for (_, group) in groups {
        out.extend(group);
    }
    out
}
