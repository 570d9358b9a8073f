//! Git worktree management for worker isolation.
//!
//! Each task runs in its own git worktree rooted under a dedicated
//! sibling directory of the main checkout, on a branch derived from the
//! task id. Worktrees share the object store of the main repository but
//! have independent working directories and index files, so two workers
//! can never observe each other's uncommitted changes.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (it takes a lock file on the shared object store), so all
//! mutating operations are serialized through an internal mutex.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

use crate::git::{self, GitError};

/// Branch namespace prefix for task branches.
pub const BRANCH_PREFIX: &str = "undercity/";

/// Errors that can occur during worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The main repository path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// The main repository is in a state that would corrupt sibling
    /// worktrees (bare without self-heal, or detached HEAD).
    #[error("repository at {path} is unusable: {reason}")]
    DegenerateRepo { path: PathBuf, reason: String },

    /// A ref or branch name failed the allow-list check.
    #[error("invalid ref name: {0:?}")]
    InvalidRef(String),

    /// An underlying git command failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// The worktree path exists with a different branch than expected.
    #[error("worktree path exists but has unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// A live worktree owned by a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Owning task.
    pub task_id: Uuid,
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Task branch checked out in the worktree.
    pub branch: String,
    /// Mainline SHA the branch was created from.
    pub base_sha: String,
}

/// Manages per-task git worktrees.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    main_branch: String,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            main_branch: self.main_branch.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Create a manager for the repository at `repo_path`.
    ///
    /// Verifies the path is a usable (non-bare, non-detached) working
    /// tree, self-healing a degenerate `core.bare=true` configuration
    /// left behind by an interrupted operation, and auto-detects the
    /// mainline branch. Worktrees default to the sibling directory
    /// `../<repo-name>-undercity-worktrees/`.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        if !git::git_ok(&repo_path, &["rev-parse", "--git-dir"]).unwrap_or(false) {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        // Self-heal: a repo flipped to bare (e.g. by a crashed tool) still
        // has its working tree on disk; flipping core.bare back restores it.
        if git::git(&repo_path, &["rev-parse", "--is-bare-repository"])? == "true" {
            tracing::warn!(
                path = %repo_path.display(),
                "repository is marked bare; attempting self-heal"
            );
            git::git(&repo_path, &["config", "core.bare", "false"])?;
            if git::git(&repo_path, &["rev-parse", "--is-bare-repository"])? == "true" {
                return Err(WorktreeError::DegenerateRepo {
                    path: repo_path,
                    reason: "bare repository (self-heal failed)".into(),
                });
            }
        }

        // A detached mainline HEAD would make every branch base ambiguous.
        if !git::git_ok(&repo_path, &["symbolic-ref", "-q", "HEAD"])? {
            return Err(WorktreeError::DegenerateRepo {
                path: repo_path,
                reason: "detached HEAD on mainline".into(),
            });
        }

        let main_branch = detect_main_branch(&repo_path);

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-undercity-worktrees");
            repo_path
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            main_branch,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn main_repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn main_branch(&self) -> &str {
        &self.main_branch
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Branch name for a task: `undercity/<task-id>`.
    pub fn branch_name(task_id: Uuid) -> String {
        format!("{BRANCH_PREFIX}{task_id}")
    }

    /// Current mainline HEAD SHA.
    pub fn main_head_sha(&self) -> Result<String, WorktreeError> {
        Ok(git::git(&self.repo_path, &["rev-parse", "HEAD"])?)
    }

    /// Create a worktree for `task_id` off the current mainline HEAD.
    ///
    /// Idempotent: an existing worktree on the expected branch is
    /// returned as-is (crash-restart path). Partial state from a failed
    /// creation is cleaned up on a best-effort basis.
    pub fn create_worktree(&self, task_id: Uuid) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let branch = Self::branch_name(task_id);
        validate_ref(&branch)?;
        let worktree_path = self.worktree_base.join(task_id.to_string());
        let base_sha = git::git(&self.repo_path, &["rev-parse", "HEAD"])?;

        // Already registered at the expected path?
        if let Some(existing) = self.find_entry_by_path(&worktree_path)? {
            match existing.branch.as_deref() {
                Some(b) if b == branch => {
                    tracing::info!(
                        task_id = %task_id,
                        path = %worktree_path.display(),
                        "worktree already exists, reusing"
                    );
                    return Ok(WorktreeInfo {
                        task_id,
                        path: existing.path,
                        branch,
                        base_sha: existing.head,
                    });
                }
                Some(b) => {
                    return Err(WorktreeError::BranchMismatch {
                        expected: branch,
                        found: b.to_owned(),
                    });
                }
                None => {
                    return Err(WorktreeError::BranchMismatch {
                        expected: branch,
                        found: "(detached)".to_owned(),
                    });
                }
            }
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| {
                WorktreeError::Git(GitError::Run {
                    command: format!("create {}", self.worktree_base.display()),
                    source: e,
                })
            })?;
        }

        let path_str = worktree_path.to_string_lossy().into_owned();
        let branch_ref = format!("refs/heads/{branch}");
        let branch_exists = git::git_ok(&self.repo_path, &["rev-parse", "--verify", &branch_ref])?;

        let result = if branch_exists {
            git::git(&self.repo_path, &["worktree", "add", &path_str, &branch])
        } else {
            git::git(
                &self.repo_path,
                &["worktree", "add", "-b", &branch, &path_str, "HEAD"],
            )
        };

        if let Err(e) = result {
            self.cleanup_partial(&worktree_path);
            return Err(e.into());
        }

        Ok(WorktreeInfo {
            task_id,
            path: worktree_path,
            branch,
            base_sha,
        })
    }

    /// Remove a worktree by path. Idempotent; `force` discards any
    /// uncommitted state.
    pub fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_entry_by_path(path)?.is_none() {
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory exists but is not a registered worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);

        match git::git(&self.repo_path, &args) {
            Ok(_) => Ok(()),
            Err(GitError::Exit { stderr, .. }) if stderr.contains("is not a working tree") => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a task branch. Safe after a fast-forward merge; `Ok` even
    /// if the branch is already gone.
    pub fn delete_branch(&self, branch: &str) -> Result<(), WorktreeError> {
        validate_ref(branch)?;
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        match git::git(&self.repo_path, &["branch", "-D", branch]) {
            Ok(_) => Ok(()),
            Err(GitError::Exit { stderr, .. }) if stderr.contains("not found") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All live task worktrees (entries under the managed base directory
    /// on an `undercity/` branch).
    pub fn list_active_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let entries = self.list_entries()?;
        let mut out = Vec::new();
        for entry in entries {
            let Some(branch) = entry.branch else { continue };
            let Some(id_str) = branch.strip_prefix(BRANCH_PREFIX) else {
                continue;
            };
            let Ok(task_id) = Uuid::parse_str(id_str) else {
                continue;
            };
            out.push(WorktreeInfo {
                task_id,
                path: entry.path,
                branch,
                base_sha: entry.head,
            });
        }
        Ok(out)
    }

    /// Prune stale worktree registrations whose directories are gone.
    pub fn prune_stale(&self) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        git::git(&self.repo_path, &["worktree", "prune"])?;
        Ok(())
    }

    fn list_entries(&self) -> Result<Vec<PorcelainEntry>, WorktreeError> {
        let stdout = git::git(&self.repo_path, &["worktree", "list", "--porcelain"])?;
        parse_porcelain_output(&stdout)
    }

    fn find_entry_by_path(&self, path: &Path) -> Result<Option<PorcelainEntry>, WorktreeError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        for entry in self.list_entries()? {
            let entry_canonical = entry
                .path
                .canonicalize()
                .unwrap_or_else(|_| entry.path.clone());
            if entry_canonical == canonical {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = git::git(&self.repo_path, &["worktree", "prune"]);
    }
}

/// Detect the mainline branch: remote HEAD, falling back to the current
/// branch, ultimately `"main"`.
fn detect_main_branch(repo: &Path) -> String {
    if let Ok(refname) = git::git(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = refname.strip_prefix("refs/remotes/origin/") {
            if !branch.is_empty() {
                return branch.to_owned();
            }
        }
    }
    if let Ok(branch) = git::git(repo, &["branch", "--show-current"]) {
        if !branch.is_empty() {
            return branch;
        }
    }
    "main".to_owned()
}

/// Allow-list check for branch/ref names handed to git.
///
/// Accepts ASCII alphanumerics plus `/ . _ -`; rejects empty names,
/// leading `-` (option injection), `..` (ref traversal), and a trailing
/// `.lock` component.
pub fn validate_ref(name: &str) -> Result<(), WorktreeError> {
    let ok = !name.is_empty()
        && !name.starts_with('-')
        && !name.contains("..")
        && !name.ends_with(".lock")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(WorktreeError::InvalidRef(name.to_owned()))
    }
}

/// One block of `git worktree list --porcelain` output.
#[derive(Debug)]
struct PorcelainEntry {
    path: PathBuf,
    head: String,
    branch: Option<String>,
}

/// Parse the porcelain output of `git worktree list --porcelain`.
///
/// Blocks are separated by blank lines:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// The main worktree may show `bare` and detached worktrees `detached`
/// instead of `branch`.
fn parse_porcelain_output(output: &str) -> Result<Vec<PorcelainEntry>, WorktreeError> {
    let mut entries = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                entries.push(PorcelainEntry {
                    path,
                    head,
                    branch: current_branch.take(),
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string();
            current_branch = Some(branch);
        }
        // `bare`, `detached`, `prunable` markers are ignored.
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        entries.push(PorcelainEntry {
            path,
            head,
            branch: current_branch,
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };

        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@undercity.dev"]);
        run(&["config", "user.name", "Undercity Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test repo\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    fn manager(repo: &Path) -> (TempDir, WorktreeManager) {
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(repo, Some(base.path().to_path_buf())).unwrap();
        (base, mgr)
    }

    #[test]
    fn rejects_non_repo() {
        let dir = TempDir::new().unwrap();
        let result = WorktreeManager::new(dir.path(), None);
        assert!(matches!(result, Err(WorktreeError::NotAGitRepo(_))));
    }

    #[test]
    fn detects_main_branch() {
        let (_dir, repo) = create_temp_repo();
        let (_base, mgr) = manager(&repo);
        assert_eq!(mgr.main_branch(), "main");
    }

    #[test]
    fn default_base_is_sibling_directory() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo, None).unwrap();
        let repo_name = repo.file_name().unwrap().to_str().unwrap();
        let expected = repo
            .parent()
            .unwrap()
            .join(format!("{repo_name}-undercity-worktrees"));
        assert_eq!(mgr.worktree_base(), expected);
    }

    #[test]
    fn branch_name_is_namespaced() {
        let id = Uuid::new_v4();
        let branch = WorktreeManager::branch_name(id);
        assert!(branch.starts_with("undercity/"));
        assert!(branch.contains(&id.to_string()));
        validate_ref(&branch).unwrap();
    }

    #[test]
    fn ref_validation() {
        validate_ref("undercity/abc-123").unwrap();
        assert!(validate_ref("").is_err());
        assert!(validate_ref("-rf").is_err());
        assert!(validate_ref("a..b").is_err());
        assert!(validate_ref("has space").is_err());
        assert!(validate_ref("x;rm").is_err());
        assert!(validate_ref("refs/heads/x.lock").is_err());
    }

    #[test]
    fn create_records_base_sha_and_isolates() {
        let (_dir, repo) = create_temp_repo();
        let (_base, mgr) = manager(&repo);
        let task_id = Uuid::new_v4();

        let info = mgr.create_worktree(task_id).unwrap();
        assert!(info.path.exists());
        assert_eq!(info.base_sha, mgr.main_head_sha().unwrap());
        assert_eq!(info.branch, WorktreeManager::branch_name(task_id));

        // A file written in the worktree does not appear in the main repo.
        std::fs::write(info.path.join("agent-work.txt"), "output\n").unwrap();
        assert!(!repo.join("agent-work.txt").exists());
    }

    #[test]
    fn create_is_idempotent() {
        let (_dir, repo) = create_temp_repo();
        let (_base, mgr) = manager(&repo);
        let task_id = Uuid::new_v4();

        let a = mgr.create_worktree(task_id).unwrap();
        let b = mgr.create_worktree(task_id).unwrap();
        assert_eq!(a.path, b.path);
        assert_eq!(a.branch, b.branch);
    }

    #[test]
    fn distinct_tasks_get_disjoint_worktrees() {
        let (_dir, repo) = create_temp_repo();
        let (_base, mgr) = manager(&repo);

        let a = mgr.create_worktree(Uuid::new_v4()).unwrap();
        let b = mgr.create_worktree(Uuid::new_v4()).unwrap();
        assert_ne!(a.path, b.path);
        assert_ne!(a.branch, b.branch);

        let active = mgr.list_active_worktrees().unwrap();
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, repo) = create_temp_repo();
        let (_base, mgr) = manager(&repo);
        let info = mgr.create_worktree(Uuid::new_v4()).unwrap();

        mgr.remove_worktree(&info.path, true).unwrap();
        assert!(!info.path.exists());
        mgr.remove_worktree(&info.path, true).unwrap();
    }

    #[test]
    fn list_skips_foreign_worktrees() {
        let (_dir, repo) = create_temp_repo();
        let (_base, mgr) = manager(&repo);

        // A manually created worktree on a non-undercity branch.
        let foreign = TempDir::new().unwrap();
        let foreign_path = foreign.path().join("manual");
        let output = Command::new("git")
            .args([
                "worktree",
                "add",
                "-b",
                "feature/manual",
                foreign_path.to_str().unwrap(),
            ])
            .current_dir(&repo)
            .output()
            .unwrap();
        assert!(output.status.success());

        let active = mgr.list_active_worktrees().unwrap();
        assert!(active.is_empty());
    }

    #[test]
    fn self_heal_bare_repo() {
        let (_dir, repo) = create_temp_repo();
        // Simulate the degenerate state.
        let output = Command::new("git")
            .args(["config", "core.bare", "true"])
            .current_dir(&repo)
            .output()
            .unwrap();
        assert!(output.status.success());

        let _mgr = WorktreeManager::new(&repo, None).unwrap();
        assert_eq!(
            git::git(&repo, &["rev-parse", "--is-bare-repository"]).unwrap(),
            "false"
        );
    }

    #[test]
    fn detached_head_is_rejected() {
        let (_dir, repo) = create_temp_repo();
        let sha = git::git(&repo, &["rev-parse", "HEAD"]).unwrap();
        let output = Command::new("git")
            .args(["checkout", "--detach", &sha])
            .current_dir(&repo)
            .output()
            .unwrap();
        assert!(output.status.success());

        let result = WorktreeManager::new(&repo, None);
        assert!(matches!(result, Err(WorktreeError::DegenerateRepo { .. })));
    }

    #[test]
    fn delete_branch_after_remove() {
        let (_dir, repo) = create_temp_repo();
        let (_base, mgr) = manager(&repo);
        let task_id = Uuid::new_v4();
        let info = mgr.create_worktree(task_id).unwrap();

        mgr.remove_worktree(&info.path, true).unwrap();
        mgr.delete_branch(&info.branch).unwrap();
        // Idempotent.
        mgr.delete_branch(&info.branch).unwrap();
    }

    #[test]
    fn parse_porcelain() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/worktrees/feature
HEAD 789abc012def
branch refs/heads/undercity/0192aaaa-bbbb-cccc-dddd-eeeeffff0000

worktree /home/user/worktrees/detached
HEAD 111222333444
detached

";
        let entries = parse_porcelain_output(input).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert!(entries[1]
            .branch
            .as_deref()
            .unwrap()
            .starts_with("undercity/"));
        assert_eq!(entries[2].branch, None);
    }
}
