//! Bounded ring of preserved failure worktrees.
//!
//! Worktrees are normally removed after a clean merge. When a task fails
//! or leaves uncommitted work, its worktree is kept for investigation --
//! but only the most recent few, or failed runs would eat the disk. The
//! ring is persisted to `worktrees-ring.json`; evicting an entry removes
//! its worktree and branch.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use undercity_state::atomic;
use undercity_state::layout::StateLayout;
use undercity_state::StateError;

use crate::worktree::WorktreeManager;

/// Default ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 10;

/// One preserved worktree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservedWorktree {
    pub task_id: Uuid,
    pub path: PathBuf,
    pub branch: String,
    pub reason: String,
    pub preserved_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RingFile {
    entries: VecDeque<PreservedWorktree>,
}

/// File-backed preserved-worktree ring.
#[derive(Debug)]
pub struct PreservedRing {
    path: PathBuf,
    capacity: usize,
    entries: VecDeque<PreservedWorktree>,
}

impl PreservedRing {
    pub fn open(layout: &StateLayout, capacity: usize) -> Result<Self, StateError> {
        let path = layout.worktrees_ring_file();
        let file: RingFile = atomic::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            capacity,
            entries: file.entries,
        })
    }

    fn persist(&self) -> Result<(), StateError> {
        atomic::write_json_atomic(
            &self.path,
            &RingFile {
                entries: self.entries.clone(),
            },
        )
    }

    /// Preserve a worktree, evicting the oldest entry past capacity.
    /// Eviction removes the old worktree and branch via `worktrees`.
    pub fn preserve(
        &mut self,
        entry: PreservedWorktree,
        worktrees: &WorktreeManager,
    ) -> Result<(), StateError> {
        tracing::info!(
            task_id = %entry.task_id,
            path = %entry.path.display(),
            reason = %entry.reason,
            "preserving worktree for investigation"
        );
        // Re-preserving the same task replaces its entry.
        self.entries.retain(|e| e.task_id != entry.task_id);
        self.entries.push_back(entry);

        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::info!(
                    task_id = %evicted.task_id,
                    "evicting preserved worktree"
                );
                if let Err(e) = worktrees.remove_worktree(&evicted.path, true) {
                    tracing::warn!(error = %e, "failed to remove evicted worktree");
                }
                if let Err(e) = worktrees.delete_branch(&evicted.branch) {
                    tracing::warn!(error = %e, "failed to delete evicted branch");
                }
            }
        }
        self.persist()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PreservedWorktree> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn temp_repo() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "t@t"],
            vec!["config", "user.name", "t"],
        ] {
            assert!(Command::new("git")
                .args(&args)
                .current_dir(&path)
                .output()
                .unwrap()
                .status
                .success());
        }
        std::fs::write(path.join("f"), "x").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "init"]] {
            assert!(Command::new("git")
                .args(&args)
                .current_dir(&path)
                .output()
                .unwrap()
                .status
                .success());
        }
        (dir, path)
    }

    #[test]
    fn ring_evicts_oldest_and_removes_its_worktree() {
        let (_repo_dir, repo) = temp_repo();
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo, Some(base.path().to_path_buf())).unwrap();

        let state_dir = tempfile::TempDir::new().unwrap();
        let layout = StateLayout::for_project(state_dir.path());
        layout.ensure().unwrap();
        let mut ring = PreservedRing::open(&layout, 2).unwrap();

        let infos: Vec<_> = (0..3)
            .map(|_| mgr.create_worktree(Uuid::new_v4()).unwrap())
            .collect();

        for info in &infos {
            ring.preserve(
                PreservedWorktree {
                    task_id: info.task_id,
                    path: info.path.clone(),
                    branch: info.branch.clone(),
                    reason: "failed".into(),
                    preserved_at: Utc::now(),
                },
                &mgr,
            )
            .unwrap();
        }

        assert_eq!(ring.len(), 2);
        // Oldest worktree was physically removed; newer two remain.
        assert!(!infos[0].path.exists());
        assert!(infos[1].path.exists());
        assert!(infos[2].path.exists());
    }

    #[test]
    fn ring_survives_reopen() {
        let (_repo_dir, repo) = temp_repo();
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo, Some(base.path().to_path_buf())).unwrap();

        let state_dir = tempfile::TempDir::new().unwrap();
        let layout = StateLayout::for_project(state_dir.path());
        layout.ensure().unwrap();

        let info = mgr.create_worktree(Uuid::new_v4()).unwrap();
        {
            let mut ring = PreservedRing::open(&layout, 4).unwrap();
            ring.preserve(
                PreservedWorktree {
                    task_id: info.task_id,
                    path: info.path.clone(),
                    branch: info.branch.clone(),
                    reason: "merge failed".into(),
                    preserved_at: Utc::now(),
                },
                &mgr,
            )
            .unwrap();
        }
        let ring = PreservedRing::open(&layout, 4).unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.entries().next().unwrap().task_id, info.task_id);
    }
}
