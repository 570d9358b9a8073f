//! The task board: a durable ordered set of tasks backed by `tasks.json`.
//!
//! Every mutation rewrites the file atomically before returning, so a
//! reader (or a restarted process) never observes a half-applied change.
//! In particular, `decompose` inserts all children and flips the parent in
//! a single rewrite: there is no on-disk state where the parent is marked
//! decomposed but a child is missing.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atomic;
use crate::models::{HandoffContext, LastAttempt, ModelTier, Task, TaskStatus};
use crate::StateError;

/// On-disk shape of `tasks.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BoardFile {
    version: u32,
    tasks: Vec<Task>,
}

const BOARD_VERSION: u32 = 1;

/// Similarity threshold above which two objectives count as duplicates.
pub const DUPLICATE_JACCARD_THRESHOLD: f64 = 0.7;

/// Filter for [`TaskBoard::list`].
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub tag: Option<String>,
    pub parent_id: Option<Uuid>,
}

/// File-backed task board.
#[derive(Debug)]
pub struct TaskBoard {
    path: PathBuf,
    tasks: Vec<Task>,
}

impl TaskBoard {
    /// Open the board at `path`, creating an empty one if the file does
    /// not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let file: BoardFile = atomic::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            tasks: file.tasks,
        })
    }

    fn persist(&self) -> Result<(), StateError> {
        let file = BoardFile {
            version: BOARD_VERSION,
            tasks: self.tasks.clone(),
        };
        atomic::write_json_atomic(&self.path, &file)
    }

    /// Number of tasks on the board (all statuses).
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Add a task. Validates that a referenced parent exists. Durable
    /// before returning.
    pub fn add(&mut self, task: Task) -> Result<Uuid, StateError> {
        if let Some(parent_id) = task.parent_id {
            if !self.tasks.iter().any(|t| t.id == parent_id) {
                return Err(StateError::ParentNotFound(parent_id));
            }
        }
        let id = task.id;
        let parent_id = task.parent_id;
        self.tasks.push(task);
        if let Some(parent_id) = parent_id {
            // Keep the parent's ordered subtask list consistent.
            if let Some(parent) = self.tasks.iter_mut().find(|t| t.id == parent_id) {
                if !parent.subtask_ids.contains(&id) {
                    parent.subtask_ids.push(id);
                }
            }
        }
        self.persist()?;
        tracing::debug!(task_id = %id, "task added to board");
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut Task, StateError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StateError::TaskNotFound(id))
    }

    /// List tasks matching a filter, in board order.
    pub fn list(&self, filter: &TaskFilter) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                filter
                    .tag
                    .as_ref()
                    .is_none_or(|tag| t.tags.iter().any(|x| x == tag))
            })
            .filter(|t| filter.parent_id.is_none_or(|p| t.parent_id == Some(p)))
            .collect()
    }

    /// Runnable tasks in admission order: priority descending, then
    /// created_at ascending. Includes `in_progress` tasks (left over from
    /// a crashed session) alongside `pending`; excludes decomposed tasks.
    pub fn list_pending(&self) -> Vec<&Task> {
        let mut out: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| {
                matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
                    && !t.is_decomposed
            })
            .collect();
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        out
    }

    /// Transition a task's status, recording an optional error message.
    /// Sets `started_at` on entry to `in_progress` and `completed_at` on
    /// terminal statuses.
    pub fn update_status(
        &mut self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), StateError> {
        let task = self.get_mut(id)?;
        if !task.status.can_transition_to(status) {
            return Err(StateError::InvalidTransition {
                task_id: id,
                from: task.status,
                to: status,
            });
        }
        let now = Utc::now();
        if status == TaskStatus::InProgress && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
        }
        task.status = status;
        task.last_error = error;
        self.persist()
    }

    /// Record the outcome of an attempt without changing status.
    pub fn record_attempt(
        &mut self,
        id: Uuid,
        model: ModelTier,
        error: Option<String>,
    ) -> Result<(), StateError> {
        let task = self.get_mut(id)?;
        let attempt_count = task
            .last_attempt
            .as_ref()
            .map_or(1, |a| a.attempt_count + 1);
        task.last_attempt = Some(LastAttempt {
            model,
            error,
            attempt_count,
        });
        self.persist()
    }

    /// Replace a task's handoff context (used when requeueing with human
    /// guidance or a prior-attempt summary).
    pub fn set_handoff(&mut self, id: Uuid, handoff: HandoffContext) -> Result<(), StateError> {
        let task = self.get_mut(id)?;
        task.handoff = Some(handoff);
        self.persist()
    }

    /// Add a tag if not already present.
    pub fn add_tag(&mut self, id: Uuid, tag: &str) -> Result<(), StateError> {
        let task = self.get_mut(id)?;
        if !task.tags.iter().any(|t| t == tag) {
            task.tags.push(tag.to_owned());
            self.persist()?;
        }
        Ok(())
    }

    /// Change a task's priority (planner recommendation).
    pub fn set_priority(&mut self, id: Uuid, priority: i32) -> Result<(), StateError> {
        let task = self.get_mut(id)?;
        task.priority = priority;
        self.persist()
    }

    /// Remove a task outright. Refused for `in_progress` tasks (a worker
    /// owns them) and decomposed parents (children would dangle).
    pub fn remove(&mut self, id: Uuid) -> Result<(), StateError> {
        let task = self.get(id).ok_or(StateError::TaskNotFound(id))?;
        if task.status == TaskStatus::InProgress {
            return Err(StateError::TaskInUse(id));
        }
        if task.is_decomposed {
            return Err(StateError::Decompose {
                task_id: id,
                reason: "cannot remove a decomposed parent".into(),
            });
        }
        let parent_id = task.parent_id;
        self.tasks.retain(|t| t.id != id);
        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.tasks.iter_mut().find(|t| t.id == parent_id) {
                parent.subtask_ids.retain(|s| *s != id);
            }
        }
        self.persist()
    }

    /// Atomically decompose `parent_id` into `subtasks`.
    ///
    /// Children get `parent_id` back-references and inherit the parent's
    /// priority unless they carry their own; the parent is flipped to
    /// `decomposed` in the same rewrite. Fails if the parent is missing,
    /// already decomposed, or `subtasks` is empty.
    pub fn decompose(
        &mut self,
        parent_id: Uuid,
        mut subtasks: Vec<Task>,
    ) -> Result<Vec<Uuid>, StateError> {
        if subtasks.is_empty() {
            return Err(StateError::Decompose {
                task_id: parent_id,
                reason: "no subtasks supplied".into(),
            });
        }
        let parent = self
            .tasks
            .iter()
            .find(|t| t.id == parent_id)
            .ok_or(StateError::TaskNotFound(parent_id))?;
        if parent.is_decomposed {
            return Err(StateError::Decompose {
                task_id: parent_id,
                reason: "already decomposed".into(),
            });
        }
        if parent.status.is_terminal() {
            return Err(StateError::Decompose {
                task_id: parent_id,
                reason: format!("parent status is {}", parent.status),
            });
        }
        let parent_priority = parent.priority;

        let mut child_ids = Vec::with_capacity(subtasks.len());
        for sub in &mut subtasks {
            sub.parent_id = Some(parent_id);
            if sub.priority == 0 {
                sub.priority = parent_priority;
            }
            child_ids.push(sub.id);
        }

        // Apply everything in memory, then persist once: readers never see
        // a decomposed parent without its children.
        self.tasks.append(&mut subtasks);
        let parent = self.get_mut(parent_id)?;
        parent.subtask_ids.extend(child_ids.iter().copied());
        parent.is_decomposed = true;
        parent.status = TaskStatus::Decomposed;
        parent.completed_at = Some(Utc::now());
        self.persist()?;

        tracing::info!(
            parent_id = %parent_id,
            children = child_ids.len(),
            "task decomposed"
        );
        Ok(child_ids)
    }

    /// Complete a decomposed parent iff every subtask is `complete`.
    /// Returns whether the parent was completed by this call.
    pub fn complete_parent_if_all_subtasks_done(
        &mut self,
        parent_id: Uuid,
    ) -> Result<bool, StateError> {
        let parent = self
            .tasks
            .iter()
            .find(|t| t.id == parent_id)
            .ok_or(StateError::TaskNotFound(parent_id))?;
        if !parent.is_decomposed || parent.status == TaskStatus::Complete {
            return Ok(false);
        }
        let all_done = parent
            .subtask_ids
            .iter()
            .all(|id| self.get(*id).is_some_and(|t| t.status == TaskStatus::Complete));
        if !all_done {
            return Ok(false);
        }
        let parent = self.get_mut(parent_id)?;
        parent.status = TaskStatus::Complete;
        parent.completed_at = Some(Utc::now());
        self.persist()?;
        tracing::info!(parent_id = %parent_id, "parent auto-completed");
        Ok(true)
    }

    /// Find an `in_progress` task whose objective is similar to
    /// `objective` at or above `threshold`.
    ///
    /// Tokenizer: lowercase the text, split on non-alphanumeric
    /// boundaries, keep runs of length >= 2, deduplicate into a set.
    /// Similarity is Jaccard over the two token sets.
    pub fn find_similar_in_progress(&self, objective: &str, threshold: f64) -> Option<&Task> {
        let target = tokenize(objective);
        if target.is_empty() {
            return None;
        }
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| (t, jaccard(&target, &tokenize(&t.objective))))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(t, _)| t)
    }
}

/// Lowercase alphanumeric token set of a string. Runs shorter than 2
/// characters are dropped (single letters carry no signal).
pub fn tokenize(s: &str) -> HashSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(str::to_owned)
        .collect()
}

/// Jaccard similarity of two token sets.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
