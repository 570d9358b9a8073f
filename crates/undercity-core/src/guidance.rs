//! Human-guidance store keyed by error signature.
//!
//! A task that keeps failing with the same error is not going to succeed
//! by brute force. Failures are fingerprinted by a normalized hash of the
//! error text; once the same signature recurs, the task is parked as
//! `needs_human_input`. An operator can attach guidance to the signature,
//! which makes every parked task with that signature retryable with the
//! guidance folded into its handoff context.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use undercity_state::atomic;
use undercity_state::layout::StateLayout;
use undercity_state::StateError;

/// Board tag applied to parked tasks.
pub const NEEDS_HUMAN_INPUT_TAG: &str = "needs_human_input";

/// Occurrences of one signature before a task is parked.
pub const PARK_AFTER_OCCURRENCES: u32 = 2;

/// One tracked failure signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceEntry {
    pub signature: String,
    /// First-seen excerpt of the error, for operator display.
    pub error_excerpt: String,
    pub occurrences: u32,
    pub task_ids: Vec<Uuid>,
    #[serde(default)]
    pub guidance: Option<String>,
    pub first_seen: DateTime<Utc>,
    #[serde(default)]
    pub provided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GuidanceFile {
    entries: BTreeMap<String, GuidanceEntry>,
}

/// File-backed guidance store (`human-guidance.json`).
#[derive(Debug)]
pub struct HumanGuidanceStore {
    path: PathBuf,
    entries: BTreeMap<String, GuidanceEntry>,
}

impl HumanGuidanceStore {
    pub fn open(layout: &StateLayout) -> Result<Self, StateError> {
        let path = layout.human_guidance_file();
        let file: GuidanceFile = atomic::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            entries: file.entries,
        })
    }

    fn persist(&self) -> Result<(), StateError> {
        atomic::write_json_atomic(
            &self.path,
            &GuidanceFile {
                entries: self.entries.clone(),
            },
        )
    }

    /// Record a failure occurrence. Returns the updated occurrence count
    /// for the signature.
    pub fn record_failure(
        &mut self,
        task_id: Uuid,
        error_text: &str,
    ) -> Result<u32, StateError> {
        let signature = error_signature(error_text);
        let entry = self
            .entries
            .entry(signature.clone())
            .or_insert_with(|| GuidanceEntry {
                signature,
                error_excerpt: error_text.chars().take(400).collect(),
                occurrences: 0,
                task_ids: Vec::new(),
                guidance: None,
                first_seen: Utc::now(),
                provided_at: None,
            });
        entry.occurrences += 1;
        if !entry.task_ids.contains(&task_id) {
            entry.task_ids.push(task_id);
        }
        let occurrences = entry.occurrences;
        self.persist()?;
        Ok(occurrences)
    }

    /// Whether a failure with this error text should park its task.
    pub fn should_park(&self, error_text: &str) -> bool {
        let signature = error_signature(error_text);
        self.entries
            .get(&signature)
            .is_some_and(|e| e.occurrences >= PARK_AFTER_OCCURRENCES && e.guidance.is_none())
    }

    /// Attach operator guidance to a signature.
    pub fn provide(&mut self, signature: &str, guidance: &str) -> Result<(), StateError> {
        let entry = self
            .entries
            .get_mut(signature)
            .ok_or_else(|| StateError::Io {
                context: format!("unknown guidance signature {signature}"),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })?;
        entry.guidance = Some(guidance.to_owned());
        entry.provided_at = Some(Utc::now());
        self.persist()
    }

    /// Guidance for an error text, if an operator provided some.
    pub fn guidance_for(&self, error_text: &str) -> Option<&GuidanceEntry> {
        let signature = error_signature(error_text);
        self.entries
            .get(&signature)
            .filter(|e| e.guidance.is_some())
    }

    /// Entries with no guidance yet, oldest first.
    pub fn pending(&self) -> Vec<&GuidanceEntry> {
        let mut out: Vec<&GuidanceEntry> = self
            .entries
            .values()
            .filter(|e| e.guidance.is_none())
            .collect();
        out.sort_by_key(|e| e.first_seen);
        out
    }

    /// Entries that have guidance, for retry sweeps.
    pub fn resolved(&self) -> Vec<&GuidanceEntry> {
        self.entries
            .values()
            .filter(|e| e.guidance.is_some())
            .collect()
    }
}

/// Stable fingerprint of an error message.
///
/// Normalizes the volatile parts (digits, hex runs, absolute paths) so
/// "timeout after 301s in /tmp/wt-abc12" and "timeout after 299s in
/// /tmp/wt-ff901" collide, then hashes. First 16 hex chars of SHA-256.
pub fn error_signature(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    for token in text.split_whitespace() {
        if token.contains('/') {
            normalized.push_str("<path>");
        } else if token.chars().all(|c| c.is_ascii_hexdigit()) && token.len() >= 6 {
            normalized.push_str("<hex>");
        } else {
            for c in token.chars() {
                normalized.push(if c.is_ascii_digit() { '#' } else { c });
            }
        }
        normalized.push(' ');
    }
    let digest = Sha256::digest(normalized.trim().as_bytes());
    hex::encode(digest)[..16].to_owned()
}
