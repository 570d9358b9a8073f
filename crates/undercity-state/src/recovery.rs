//! Crash-safe per-task state records.
//!
//! Layout under the state directory:
//!
//! ```text
//! active/<taskId>.json       in-flight tasks
//! completed/<taskId>.json    terminal tasks
//! batch/<batchId>.json       batch metadata
//! checkpoints/<taskId>.json  worker progress records
//! ```
//!
//! A task id appears in exactly one of `active/` and `completed/`:
//! [`RecoveryStore::mark_task_completed`] writes the completed record
//! before deleting the active one, so a crash between the two steps leaves
//! both (resolved in favor of `completed/` by [`RecoveryStore::scan_active_tasks`])
//! rather than neither.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use uuid::Uuid;

use crate::atomic;
use crate::layout::StateLayout;
use crate::models::{ActiveTaskState, BatchMetadata, Checkpoint, CompletedTaskState, TaskStatus};
use crate::StateError;

/// File-backed recovery store.
#[derive(Debug, Clone)]
pub struct RecoveryStore {
    active_dir: PathBuf,
    completed_dir: PathBuf,
    batch_dir: PathBuf,
    checkpoints_dir: PathBuf,
}

impl RecoveryStore {
    /// Open the store inside an ensured [`StateLayout`].
    pub fn open(layout: &StateLayout) -> Result<Self, StateError> {
        layout.ensure()?;
        Ok(Self {
            active_dir: layout.active_dir(),
            completed_dir: layout.completed_dir(),
            batch_dir: layout.batch_dir(),
            checkpoints_dir: layout.checkpoints_dir(),
        })
    }

    fn active_path(&self, task_id: Uuid) -> PathBuf {
        self.active_dir.join(format!("{task_id}.json"))
    }

    fn completed_path(&self, task_id: Uuid) -> PathBuf {
        self.completed_dir.join(format!("{task_id}.json"))
    }

    fn batch_path(&self, batch_id: Uuid) -> PathBuf {
        self.batch_dir.join(format!("{batch_id}.json"))
    }

    fn checkpoint_path(&self, task_id: Uuid) -> PathBuf {
        self.checkpoints_dir.join(format!("{task_id}.json"))
    }

    // -- active records -----------------------------------------------------

    /// Write (or overwrite) the in-flight record for a task.
    pub fn write_active_task(&self, state: &ActiveTaskState) -> Result<(), StateError> {
        atomic::write_json_atomic(&self.active_path(state.task_id), state)
    }

    /// Update only the status field of an active record.
    pub fn update_active_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
    ) -> Result<(), StateError> {
        let path = self.active_path(task_id);
        let mut state: ActiveTaskState =
            atomic::read_json(&path)?.ok_or(StateError::TaskNotFound(task_id))?;
        state.status = status;
        atomic::write_json_atomic(&path, &state)
    }

    /// Move a task from `active/` to `completed/`.
    ///
    /// The completed record is written first; the active record is removed
    /// second. Idempotent with respect to a crash in between.
    pub fn mark_task_completed(&self, record: &CompletedTaskState) -> Result<(), StateError> {
        atomic::write_json_atomic(&self.completed_path(record.task_id), record)?;
        let active = self.active_path(record.task_id);
        match std::fs::remove_file(&active) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(format!("remove {}", active.display()), e)),
        }
    }

    /// All in-flight tasks: exactly those whose workers did not reach a
    /// terminal status. An id that also has a completed record is treated
    /// as completed (crash between the two writes of
    /// [`Self::mark_task_completed`]).
    pub fn scan_active_tasks(&self) -> Result<Vec<ActiveTaskState>, StateError> {
        let mut out = Vec::new();
        for entry in read_dir_json(&self.active_dir)? {
            let state: ActiveTaskState = match atomic::read_json(&entry)? {
                Some(s) => s,
                None => continue,
            };
            if self.completed_path(state.task_id).exists() {
                // Half-finished completion: finish the move and skip.
                let _ = std::fs::remove_file(&entry);
                continue;
            }
            out.push(state);
        }
        out.sort_by_key(|s| s.started_at);
        Ok(out)
    }

    pub fn has_active_tasks(&self) -> Result<bool, StateError> {
        Ok(!self.scan_active_tasks()?.is_empty())
    }

    /// All terminal records, oldest first.
    pub fn get_completed_tasks(&self) -> Result<Vec<CompletedTaskState>, StateError> {
        let mut out = Vec::new();
        for entry in read_dir_json(&self.completed_dir)? {
            if let Some(state) = atomic::read_json::<CompletedTaskState>(&entry)? {
                out.push(state);
            }
        }
        out.sort_by_key(|s| s.finished_at);
        Ok(out)
    }

    // -- batch metadata -----------------------------------------------------

    pub fn save_batch_metadata(&self, meta: &BatchMetadata) -> Result<(), StateError> {
        atomic::write_json_atomic(&self.batch_path(meta.batch_id), meta)
    }

    pub fn get_batch_metadata(&self, batch_id: Uuid) -> Result<Option<BatchMetadata>, StateError> {
        atomic::read_json(&self.batch_path(batch_id))
    }

    /// Most recently started batch record, if any.
    pub fn latest_batch_metadata(&self) -> Result<Option<BatchMetadata>, StateError> {
        let mut latest: Option<BatchMetadata> = None;
        for entry in read_dir_json(&self.batch_dir)? {
            if let Some(meta) = atomic::read_json::<BatchMetadata>(&entry)? {
                if latest.as_ref().is_none_or(|l| meta.started_at > l.started_at) {
                    latest = Some(meta);
                }
            }
        }
        Ok(latest)
    }

    pub fn clear_batch(&self, batch_id: Uuid) -> Result<(), StateError> {
        let path = self.batch_path(batch_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(format!("remove {}", path.display()), e)),
        }
    }

    // -- checkpoints --------------------------------------------------------

    pub fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StateError> {
        atomic::write_json_atomic(&self.checkpoint_path(checkpoint.task_id), checkpoint)
    }

    pub fn read_checkpoint(&self, task_id: Uuid) -> Result<Option<Checkpoint>, StateError> {
        atomic::read_json(&self.checkpoint_path(task_id))
    }

    /// Filesystem mtime of a checkpoint, used by the health monitor as the
    /// liveness signal (cheaper than parsing on every tick).
    pub fn checkpoint_mtime(&self, task_id: Uuid) -> Result<Option<SystemTime>, StateError> {
        let path = self.checkpoint_path(task_id);
        match std::fs::metadata(&path) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .map_err(|e| StateError::io(format!("mtime {}", path.display()), e))?;
                Ok(Some(mtime))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::io(format!("stat {}", path.display()), e)),
        }
    }

    pub fn clear_checkpoint(&self, task_id: Uuid) -> Result<(), StateError> {
        let path = self.checkpoint_path(task_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(format!("remove {}", path.display()), e)),
        }
    }
}

/// All `*.json` entries of a directory (non-recursive). Skips temp files.
fn read_dir_json(dir: &Path) -> Result<Vec<PathBuf>, StateError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| StateError::io(format!("read dir {}", dir.display()), e))?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StateError::io(format!("read dir {}", dir.display()), e))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".json") && !name.starts_with('.') {
            out.push(path);
        }
    }
    Ok(out)
}
