//! Durable state for the undercity grid: the task board, the crash-recovery
//! store, worker checkpoints, and the append-only event log.
//!
//! Everything in this crate is file-backed under a single state directory
//! (`.undercity/` by convention). Every record write goes through
//! [`atomic::write_json_atomic`] (write-to-temp, fsync, rename) so a crash
//! at any instant leaves either the old record or the new one, never a
//! torn file.

pub mod atomic;
pub mod board;
pub mod events;
pub mod layout;
pub mod models;
pub mod recovery;

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the state crate.
#[derive(Debug, Error)]
pub enum StateError {
    /// An underlying filesystem operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized.
    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// A record on disk could not be parsed.
    #[error("malformed record at {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A task id was not found on the board.
    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    /// A parent id referenced by a new task does not exist.
    #[error("parent task {0} not found")]
    ParentNotFound(Uuid),

    /// A status transition violates the task lifecycle graph.
    #[error("invalid status transition {from} -> {to} for task {task_id}")]
    InvalidTransition {
        task_id: Uuid,
        from: models::TaskStatus,
        to: models::TaskStatus,
    },

    /// Decompose was called with an empty subtask list or on an
    /// already-decomposed parent.
    #[error("cannot decompose task {task_id}: {reason}")]
    Decompose { task_id: Uuid, reason: String },

    /// The task is owned by a live worker and cannot be removed.
    #[error("task {0} is in progress and cannot be removed")]
    TaskInUse(Uuid),
}

impl StateError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
