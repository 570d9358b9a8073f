//! Meta-task recommendations.
//!
//! A `[meta:<type>]` objective runs in the main checkout and returns a
//! JSON array of board recommendations instead of code. The orchestrator
//! is the single point of board mutation: every recommendation is
//! validated here (existence, confidence floor, safety caps) before it is
//! applied.

use serde::Deserialize;
use uuid::Uuid;

use undercity_state::board::TaskBoard;
use undercity_state::models::TaskStatus;

/// Recommendations below this confidence are discarded.
pub const MIN_CONFIDENCE: f64 = 0.8;
/// At most this many `add` recommendations per meta run.
pub const MAX_ADDS_PER_RUN: usize = 20;
/// At most this fraction of the board may be removed per meta run.
pub const MAX_REMOVAL_FRACTION: f64 = 0.5;

/// What a recommendation asks the orchestrator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecAction {
    Add,
    Remove,
    Prioritize,
    FixStatus,
    Merge,
    Review,
}

/// One typed recommendation from a meta-task agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Recommendation {
    pub action: RecAction,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    pub confidence: f64,
}

/// Pull the first JSON array out of agent text and parse it. Agents
/// wrap JSON in prose often enough that strict parsing loses real output.
pub fn parse_recommendations(text: &str) -> anyhow::Result<Vec<Recommendation>> {
    let start = text
        .find('[')
        .ok_or_else(|| anyhow::anyhow!("no JSON array in meta response"))?;
    let end = text
        .rfind(']')
        .ok_or_else(|| anyhow::anyhow!("unterminated JSON array in meta response"))?;
    let json = &text[start..=end];
    let recs: Vec<Recommendation> = serde_json::from_str(json)?;
    Ok(recs)
}

/// Filter recommendations against the board and the safety caps.
/// Returns the accepted subset and a human-readable rejection list.
pub fn validate(
    recommendations: Vec<Recommendation>,
    board: &TaskBoard,
) -> (Vec<Recommendation>, Vec<String>) {
    let board_size = board.len();
    let max_removals = (board_size as f64 * MAX_REMOVAL_FRACTION).floor() as usize;
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut adds = 0usize;
    let mut removals = 0usize;

    for rec in recommendations {
        if rec.confidence < MIN_CONFIDENCE {
            rejected.push(format!(
                "{:?}: confidence {:.2} below {MIN_CONFIDENCE}",
                rec.action, rec.confidence
            ));
            continue;
        }
        match rec.action {
            RecAction::Add => {
                if rec.objective.as_deref().is_none_or(str::is_empty) {
                    rejected.push("add: missing objective".into());
                    continue;
                }
                if adds >= MAX_ADDS_PER_RUN {
                    rejected.push(format!("add: cap of {MAX_ADDS_PER_RUN} reached"));
                    continue;
                }
                adds += 1;
            }
            RecAction::Remove => {
                let Some(id) = rec.task_id else {
                    rejected.push("remove: missing task_id".into());
                    continue;
                };
                if board.get(id).is_none() {
                    rejected.push(format!("remove: unknown task {id}"));
                    continue;
                }
                if removals >= max_removals {
                    rejected.push(format!(
                        "remove: cap of {max_removals} (50% of board) reached"
                    ));
                    continue;
                }
                removals += 1;
            }
            RecAction::Prioritize => {
                let valid = rec
                    .task_id
                    .is_some_and(|id| board.get(id).is_some())
                    && rec.priority.is_some();
                if !valid {
                    rejected.push("prioritize: needs an existing task_id and a priority".into());
                    continue;
                }
            }
            RecAction::FixStatus => {
                let known = rec.task_id.is_some_and(|id| board.get(id).is_some());
                let parses = rec
                    .status
                    .as_deref()
                    .is_some_and(|s| s.parse::<TaskStatus>().is_ok());
                if !known || !parses {
                    rejected.push("fix_status: needs an existing task_id and a valid status".into());
                    continue;
                }
            }
            RecAction::Merge | RecAction::Review => {
                // Advisory only; surfaced to the operator, never applied
                // automatically. Still validated for existence.
                if rec.task_id.is_some_and(|id| board.get(id).is_none()) {
                    rejected.push(format!("{:?}: unknown task", rec.action));
                    continue;
                }
            }
        }
        accepted.push(rec);
    }

    (accepted, rejected)
}
