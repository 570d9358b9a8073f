//! Append-only structured event log (`grind-events.jsonl`).
//!
//! One JSON object per line, tagged by `type`. The log is the audit trail
//! for a grind session: every terminal task outcome appears exactly once,
//! bracketed by `grind_start` / `grind_end` records.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ErrorCategory, ModelTier};
use crate::StateError;

/// A single grind event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskQueued {
        task_id: Uuid,
        objective: String,
        priority: i32,
        at: DateTime<Utc>,
    },
    TaskStarted {
        task_id: Uuid,
        batch_id: Uuid,
        model: ModelTier,
        branch: String,
        at: DateTime<Utc>,
    },
    TaskComplete {
        task_id: Uuid,
        batch_id: Uuid,
        duration_ms: u64,
        merged: bool,
        at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: Uuid,
        batch_id: Uuid,
        error: ErrorCategory,
        message: Option<String>,
        at: DateTime<Utc>,
    },
    GrindStart {
        batch_id: Uuid,
        task_count: usize,
        max_concurrent: usize,
        at: DateTime<Utc>,
    },
    GrindEnd {
        batch_id: Uuid,
        completed: usize,
        failed: usize,
        merged: usize,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
}

/// Appender over the JSONL event file.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one event. The write is a single `write_all` of one line;
    /// on POSIX appends of this size land atomically enough that readers
    /// tailing the file see whole lines.
    pub fn append(&self, event: &Event) -> Result<(), StateError> {
        let mut line = serde_json::to_vec(event).map_err(|e| StateError::Serialize {
            what: "event".into(),
            source: e,
        })?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StateError::io(format!("open {}", self.path.display()), e))?;
        file.write_all(&line)
            .map_err(|e| StateError::io(format!("append {}", self.path.display()), e))
    }

    /// Read the whole log. Malformed lines are skipped with a warning
    /// (the log must stay readable even if one write was torn).
    pub fn read_all(&self) -> Result<Vec<Event>, StateError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(format!("open {}", self.path.display()), e)),
        };
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line =
                line.map_err(|e| StateError::io(format!("read {}", self.path.display()), e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => out.push(event),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed event line");
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = EventLog::new(dir.path().join("grind-events.jsonl"));

        let batch_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        log.append(&Event::GrindStart {
            batch_id,
            task_count: 2,
            max_concurrent: 3,
            at: Utc::now(),
        })
        .unwrap();
        log.append(&Event::TaskStarted {
            task_id,
            batch_id,
            model: ModelTier::Sonnet,
            branch: format!("undercity/{task_id}"),
            at: Utc::now(),
        })
        .unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::GrindStart { .. }));
        assert!(matches!(events[1], Event::TaskStarted { .. }));
    }

    #[test]
    fn empty_log_reads_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = EventLog::new(dir.path().join("missing.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn malformed_line_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("grind-events.jsonl");
        let log = EventLog::new(&path);

        log.append(&Event::TaskQueued {
            task_id: Uuid::new_v4(),
            objective: "x".into(),
            priority: 0,
            at: Utc::now(),
        })
        .unwrap();
        // A torn write.
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"type\":\"task_qu")
            .unwrap();

        assert_eq!(log.read_all().unwrap().len(), 1);
    }

    #[test]
    fn event_tag_is_snake_case() {
        let json = serde_json::to_string(&Event::GrindEnd {
            batch_id: Uuid::new_v4(),
            completed: 1,
            failed: 0,
            merged: 1,
            duration_ms: 10,
            at: Utc::now(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"grind_end\""));
    }
}
