//! Per-task file access records and cross-task conflict prediction.
//!
//! Two sibling tasks that edit the same path will collide at merge time;
//! the tracker exists to predict that before admission. It keeps two
//! persistent artifacts:
//!
//! - `file-tracking.json`: live per-task access records (read/edit).
//! - `routing-profile.json`: learned keyword -> path weights, updated from
//!   each completed task's actual modifications.
//!
//! A cold profile falls back to extracting path-looking tokens straight
//! from the objective text.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use undercity_state::atomic;
use undercity_state::board::tokenize;
use undercity_state::layout::StateLayout;
use undercity_state::StateError;

/// Confidence at or above which a predicted file participates in conflict
/// decisions.
pub const PREDICTION_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Kind of file access a task performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Edit,
}

/// Live record for one tracked task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TaskEntry {
    worktree_root: PathBuf,
    /// path -> strongest access kind observed.
    accesses: BTreeMap<String, AccessKind>,
    /// Predicted (path, confidence) pairs registered at admission.
    #[serde(default)]
    predicted: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrackingFile {
    tasks: HashMap<Uuid, TaskEntry>,
}

/// Learned keyword -> path weights.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RoutingProfile {
    /// keyword -> (path -> observation count).
    weights: HashMap<String, HashMap<String, f64>>,
    /// Completed tasks learned from.
    observations: u64,
}

/// File tracker with persistent prediction profile.
#[derive(Debug)]
pub struct FileTracker {
    tracking_path: PathBuf,
    profile_path: PathBuf,
    tasks: HashMap<Uuid, TaskEntry>,
    profile: RoutingProfile,
}

impl FileTracker {
    pub fn open(layout: &StateLayout) -> Result<Self, StateError> {
        let tracking_path = layout.file_tracking_file();
        let profile_path = layout.routing_profile_file();
        let tracking: TrackingFile = atomic::read_json(&tracking_path)?.unwrap_or_default();
        let profile: RoutingProfile = atomic::read_json(&profile_path)?.unwrap_or_default();
        Ok(Self {
            tracking_path,
            profile_path,
            tasks: tracking.tasks,
            profile,
        })
    }

    fn persist_tracking(&self) -> Result<(), StateError> {
        atomic::write_json_atomic(
            &self.tracking_path,
            &TrackingFile {
                tasks: self.tasks.clone(),
            },
        )
    }

    fn persist_profile(&self) -> Result<(), StateError> {
        atomic::write_json_atomic(&self.profile_path, &self.profile)
    }

    /// Begin tracking a task rooted at its worktree.
    pub fn start_task_tracking(
        &mut self,
        task_id: Uuid,
        worktree_root: PathBuf,
    ) -> Result<(), StateError> {
        self.tasks.insert(
            task_id,
            TaskEntry {
                worktree_root,
                ..Default::default()
            },
        );
        self.persist_tracking()
    }

    /// Register the predicted files used for conflict decisions.
    pub fn set_predicted_files(
        &mut self,
        task_id: Uuid,
        predictions: &[(String, f64)],
    ) -> Result<(), StateError> {
        if let Some(entry) = self.tasks.get_mut(&task_id) {
            entry.predicted = predictions.iter().cloned().collect();
            self.persist_tracking()?;
        }
        Ok(())
    }

    /// Record one access. Edits dominate reads for the same path.
    pub fn record_access(
        &mut self,
        task_id: Uuid,
        path: &str,
        kind: AccessKind,
    ) -> Result<(), StateError> {
        let Some(entry) = self.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        let slot = entry.accesses.entry(path.to_owned()).or_insert(kind);
        if kind == AccessKind::Edit {
            *slot = AccessKind::Edit;
        }
        self.persist_tracking()
    }

    /// Stop tracking and drop the task's live record.
    pub fn stop_task_tracking(&mut self, task_id: Uuid) -> Result<(), StateError> {
        self.tasks.remove(&task_id);
        self.persist_tracking()
    }

    /// Paths contested between the given tasks.
    ///
    /// A path is contested when two tasks both edit it, or one edits it
    /// while another predicts it at confidence >=
    /// [`PREDICTION_CONFIDENCE_THRESHOLD`].
    pub fn detect_conflicts(&self, task_ids: &[Uuid]) -> BTreeMap<String, Vec<Uuid>> {
        // path -> tasks that "claim" it (edit, or confident prediction).
        let mut edits: BTreeMap<&str, Vec<Uuid>> = BTreeMap::new();
        let mut claims: BTreeMap<&str, Vec<Uuid>> = BTreeMap::new();

        for id in task_ids {
            let Some(entry) = self.tasks.get(id) else { continue };
            for (path, kind) in &entry.accesses {
                if *kind == AccessKind::Edit {
                    edits.entry(path).or_default().push(*id);
                    claims.entry(path).or_default().push(*id);
                }
            }
            for (path, confidence) in &entry.predicted {
                if *confidence >= PREDICTION_CONFIDENCE_THRESHOLD {
                    claims.entry(path).or_default().push(*id);
                }
            }
        }

        let mut out = BTreeMap::new();
        for (path, claimants) in claims {
            let editors = edits.get(path).map_or(0, Vec::len);
            let mut ids: Vec<Uuid> = claimants;
            ids.sort();
            ids.dedup();
            if editors >= 1 && ids.len() >= 2 {
                out.insert(path.to_owned(), ids);
            }
        }
        out
    }

    /// Predict which files an objective will touch, with confidences in
    /// `0.0..=1.0`, best first.
    ///
    /// Warm path: for each objective keyword with learned weights, each
    /// path scores the keyword's conditional probability of that path;
    /// scores average across contributing keywords. Cold path (no learned
    /// signal): path-looking tokens extracted from the objective at full
    /// confidence.
    pub fn predict_relevant_files(&self, objective: &str, limit: usize) -> Vec<(String, f64)> {
        let keywords = tokenize(objective);
        let mut scores: HashMap<String, f64> = HashMap::new();
        let mut contributing = 0u32;

        for keyword in &keywords {
            let Some(paths) = self.profile.weights.get(keyword) else {
                continue;
            };
            let total: f64 = paths.values().sum();
            if total <= 0.0 {
                continue;
            }
            contributing += 1;
            for (path, weight) in paths {
                *scores.entry(path.clone()).or_default() += weight / total;
            }
        }

        if contributing == 0 {
            return extract_path_candidates(objective)
                .into_iter()
                .take(limit)
                .map(|p| (p, 1.0))
                .collect();
        }

        let mut out: Vec<(String, f64)> = scores
            .into_iter()
            .map(|(path, sum)| (path, sum / f64::from(contributing)))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out.truncate(limit);
        out
    }

    /// Learn from a completed task: every objective keyword gains weight
    /// toward every file the task actually modified.
    pub fn learn_from_completion(
        &mut self,
        objective: &str,
        modified_files: &[String],
    ) -> Result<(), StateError> {
        if modified_files.is_empty() {
            return Ok(());
        }
        for keyword in tokenize(objective) {
            let paths = self.profile.weights.entry(keyword).or_default();
            for file in modified_files {
                *paths.entry(file.clone()).or_default() += 1.0;
            }
        }
        self.profile.observations += 1;
        self.persist_profile()
    }

    /// Recorded edit paths for a task (used when ingesting results).
    pub fn edited_files(&self, task_id: Uuid) -> Vec<String> {
        self.tasks
            .get(&task_id)
            .map(|entry| {
                entry
                    .accesses
                    .iter()
                    .filter(|(_, k)| **k == AccessKind::Edit)
                    .map(|(p, _)| p.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Extract path-looking tokens from free text: anything containing a `/`
/// or ending in a known source extension.
pub fn extract_path_candidates(text: &str) -> Vec<String> {
    const EXTENSIONS: &[&str] = &[
        ".rs", ".ts", ".tsx", ".js", ".jsx", ".py", ".go", ".toml", ".json", ".md", ".yml",
        ".yaml",
    ];
    let mut out = Vec::new();
    for word in text.split_whitespace() {
        let trimmed = word.trim_matches(|c: char| {
            matches!(c, ',' | ';' | ':' | '(' | ')' | '`' | '"' | '\'' | '?')
        });
        if trimmed.is_empty() || trimmed.contains("://") {
            continue;
        }
        let looks_like_path = trimmed.contains('/')
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
        let has_extension = EXTENSIONS.iter().any(|ext| trimmed.ends_with(ext));
        if (looks_like_path || has_extension) && !out.contains(&trimmed.to_owned()) {
            out.push(trimmed.to_owned());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tracker() -> (tempfile::TempDir, FileTracker) {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = StateLayout::for_project(dir.path());
        layout.ensure().unwrap();
        let tracker = FileTracker::open(&layout).unwrap();
        (dir, tracker)
    }

    #[test]
    fn edits_dominate_reads() {
        let (_dir, mut tracker) = open_tracker();
        let id = Uuid::new_v4();
        tracker.start_task_tracking(id, "/w".into()).unwrap();
        tracker
            .record_access(id, "src/lib.rs", AccessKind::Read)
            .unwrap();
        tracker
            .record_access(id, "src/lib.rs", AccessKind::Edit)
            .unwrap();
        tracker
            .record_access(id, "src/lib.rs", AccessKind::Read)
            .unwrap();
        assert_eq!(tracker.edited_files(id), vec!["src/lib.rs".to_owned()]);
    }

    #[test]
    fn both_edit_is_a_conflict() {
        let (_dir, mut tracker) = open_tracker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.start_task_tracking(a, "/wa".into()).unwrap();
        tracker.start_task_tracking(b, "/wb".into()).unwrap();
        tracker
            .record_access(a, "src/router.rs", AccessKind::Edit)
            .unwrap();
        tracker
            .record_access(b, "src/router.rs", AccessKind::Edit)
            .unwrap();
        tracker
            .record_access(b, "src/other.rs", AccessKind::Edit)
            .unwrap();

        let conflicts = tracker.detect_conflicts(&[a, b]);
        assert_eq!(conflicts.len(), 1);
        let tasks = &conflicts["src/router.rs"];
        assert!(tasks.contains(&a) && tasks.contains(&b));
    }

    #[test]
    fn read_vs_edit_is_not_a_conflict() {
        let (_dir, mut tracker) = open_tracker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.start_task_tracking(a, "/wa".into()).unwrap();
        tracker.start_task_tracking(b, "/wb".into()).unwrap();
        tracker
            .record_access(a, "src/lib.rs", AccessKind::Edit)
            .unwrap();
        tracker
            .record_access(b, "src/lib.rs", AccessKind::Read)
            .unwrap();

        assert!(tracker.detect_conflicts(&[a, b]).is_empty());
    }

    #[test]
    fn confident_prediction_conflicts_with_edit() {
        let (_dir, mut tracker) = open_tracker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.start_task_tracking(a, "/wa".into()).unwrap();
        tracker.start_task_tracking(b, "/wb".into()).unwrap();
        tracker
            .record_access(a, "src/router.rs", AccessKind::Edit)
            .unwrap();
        tracker
            .set_predicted_files(b, &[("src/router.rs".into(), 0.8)])
            .unwrap();

        let conflicts = tracker.detect_conflicts(&[a, b]);
        assert!(conflicts.contains_key("src/router.rs"));

        // A weak prediction does not.
        tracker
            .set_predicted_files(b, &[("src/router.rs".into(), 0.3)])
            .unwrap();
        assert!(tracker.detect_conflicts(&[a, b]).is_empty());
    }

    #[test]
    fn cold_predictor_extracts_paths_from_objective() {
        let (_dir, tracker) = open_tracker();
        let predictions =
            tracker.predict_relevant_files("add retry handling in src/net/client.rs", 5);
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].0, "src/net/client.rs");
        assert!((predictions[0].1 - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn warm_predictor_learns_from_completions() {
        let (_dir, mut tracker) = open_tracker();
        for _ in 0..3 {
            tracker
                .learn_from_completion(
                    "improve websocket router reconnect",
                    &["src/router.rs".into()],
                )
                .unwrap();
        }
        tracker
            .learn_from_completion("unrelated docs change", &["README.md".into()])
            .unwrap();

        let predictions = tracker.predict_relevant_files("fix the websocket router", 5);
        assert!(!predictions.is_empty());
        assert_eq!(predictions[0].0, "src/router.rs");
        assert!(predictions[0].1 >= PREDICTION_CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn profile_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = StateLayout::for_project(dir.path());
        layout.ensure().unwrap();
        {
            let mut tracker = FileTracker::open(&layout).unwrap();
            tracker
                .learn_from_completion("tune the scheduler", &["src/sched.rs".into()])
                .unwrap();
        }
        let tracker = FileTracker::open(&layout).unwrap();
        let predictions = tracker.predict_relevant_files("tune the scheduler", 5);
        assert_eq!(predictions[0].0, "src/sched.rs");
    }

    #[test]
    fn path_extraction() {
        let paths = extract_path_candidates(
            "touch src/a.rs and lib/b.py, skip https://example.com/x and plain words",
        );
        assert_eq!(paths, vec!["src/a.rs".to_owned(), "lib/b.py".to_owned()]);
    }
}
