//! State directory layout.
//!
//! All durable state lives under a single directory, `.undercity/` at the
//! project root by convention. This module is the one place that knows the
//! file names, so the stores and the CLI agree on them.

use std::path::{Path, PathBuf};

use crate::StateError;

/// Conventional name of the state directory under the project root.
pub const STATE_DIR_NAME: &str = ".undercity";

/// Name of the per-worktree assignment file.
pub const ASSIGNMENT_FILE_NAME: &str = ".undercity-assignment.json";

/// Resolved paths inside a state directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    /// Layout rooted at an explicit state directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout at the conventional location under a project root.
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root.join(STATE_DIR_NAME))
    }

    /// Create the directory skeleton (idempotent).
    pub fn ensure(&self) -> Result<(), StateError> {
        for dir in [
            self.root.clone(),
            self.active_dir(),
            self.completed_dir(),
            self.batch_dir(),
            self.checkpoints_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| StateError::io(format!("create {}", dir.display()), e))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.root.join("completed")
    }

    pub fn batch_dir(&self) -> PathBuf {
        self.root.join("batch")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn rate_limit_file(&self) -> PathBuf {
        self.root.join("rate-limit-state.json")
    }

    pub fn file_tracking_file(&self) -> PathBuf {
        self.root.join("file-tracking.json")
    }

    pub fn routing_profile_file(&self) -> PathBuf {
        self.root.join("routing-profile.json")
    }

    pub fn worktrees_ring_file(&self) -> PathBuf {
        self.root.join("worktrees-ring.json")
    }

    pub fn emergency_file(&self) -> PathBuf {
        self.root.join("emergency.json")
    }

    pub fn human_guidance_file(&self) -> PathBuf {
        self.root.join("human-guidance.json")
    }

    pub fn events_file(&self) -> PathBuf {
        self.root.join("grind-events.jsonl")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn current_log_file(&self) -> PathBuf {
        self.logs_dir().join("current.log")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Marker file a `drain` command drops; the orchestrator stops
    /// admitting new batches while it exists.
    pub fn drain_file(&self) -> PathBuf {
        self.root.join("drain")
    }
}
