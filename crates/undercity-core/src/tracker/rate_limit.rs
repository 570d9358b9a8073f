//! Rolling token budget and rate-limit pause tracking.
//!
//! Keeps 5-hour and 7-day rolling windows of token usage per model tier,
//! counts observed rate-limit hits, and owns the pause/resume schedule.
//! State is persisted to `rate-limit-state.json` after every update; an
//! externally observed usage percentage (from whatever scrapes the
//! provider's own meters) overrides the local estimate when synced.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use undercity_state::atomic;
use undercity_state::layout::StateLayout;
use undercity_state::models::ModelTier;
use undercity_state::StateError;

/// Tracker thresholds and windows.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Token budget for the rolling 5-hour window.
    pub five_hour_token_limit: u64,
    /// Token budget for the rolling 7-day window.
    pub weekly_token_limit: u64,
    /// How long to pause after an observed rate-limit hit.
    pub hit_pause: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            five_hour_token_limit: 10_000_000,
            weekly_token_limit: 250_000_000,
            hit_pause: Duration::minutes(15),
        }
    }
}

/// One recorded agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UsageSample {
    at: DateTime<Utc>,
    task_id: Uuid,
    model: ModelTier,
    input_tokens: u64,
    output_tokens: u64,
    duration_ms: u64,
}

/// Persisted tracker state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RateLimitState {
    samples: Vec<UsageSample>,
    rate_limit_hits: u32,
    #[serde(default)]
    paused_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pause_reason: Option<String>,
    #[serde(default)]
    last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    synced_five_hour_pct: Option<f64>,
    #[serde(default)]
    synced_weekly_pct: Option<f64>,
}

/// Point-in-time usage summary for operators.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub five_hour_pct: f64,
    pub weekly_pct: f64,
    /// tier -> (input tokens, output tokens) over the weekly window.
    pub per_model: BTreeMap<ModelTier, (u64, u64)>,
    pub rate_limit_hits: u32,
    pub paused_until: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
}

/// File-backed rate-limit tracker. Owned by the orchestrator; updates are
/// in-line with worker result ingestion, never on a hot path.
#[derive(Debug)]
pub struct RateLimitTracker {
    path: PathBuf,
    config: RateLimitConfig,
    state: RateLimitState,
}

impl RateLimitTracker {
    pub fn open(layout: &StateLayout, config: RateLimitConfig) -> Result<Self, StateError> {
        let path = layout.rate_limit_file();
        let state: RateLimitState = atomic::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            config,
            state,
        })
    }

    fn persist(&self) -> Result<(), StateError> {
        atomic::write_json_atomic(&self.path, &self.state)
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(7);
        self.state.samples.retain(|s| s.at >= cutoff);
    }

    fn window_tokens(&self, now: DateTime<Utc>, window: Duration) -> u64 {
        let cutoff = now - window;
        self.state
            .samples
            .iter()
            .filter(|s| s.at >= cutoff)
            .map(|s| s.input_tokens + s.output_tokens)
            .sum()
    }

    /// Record usage from one finished agent task. Trips the pause when a
    /// rolling window crosses its budget.
    pub fn record_task(
        &mut self,
        task_id: Uuid,
        model: ModelTier,
        input_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
    ) -> Result<(), StateError> {
        let now = Utc::now();
        self.state.samples.push(UsageSample {
            at: now,
            task_id,
            model,
            input_tokens,
            output_tokens,
            duration_ms,
        });
        self.prune(now);

        let five_hour = self.window_tokens(now, Duration::hours(5));
        let weekly = self.window_tokens(now, Duration::days(7));
        if five_hour >= self.config.five_hour_token_limit {
            self.set_pause(
                "5-hour token budget exhausted".into(),
                now + self.config.hit_pause,
            );
        } else if weekly >= self.config.weekly_token_limit {
            self.set_pause(
                "weekly token budget exhausted".into(),
                now + Duration::hours(6),
            );
        }
        self.persist()
    }

    /// Record an explicit rate-limit response from the transport and
    /// pause. Repeated hits extend the pause multiplicatively.
    pub fn record_rate_limit_hit(
        &mut self,
        model: ModelTier,
        message: &str,
    ) -> Result<(), StateError> {
        let now = Utc::now();
        self.state.rate_limit_hits += 1;
        let backoff = self.config.hit_pause * i32::try_from(self.state.rate_limit_hits.min(4)).unwrap_or(4);
        tracing::warn!(
            model = %model,
            hits = self.state.rate_limit_hits,
            message,
            "rate limit hit, pausing"
        );
        self.set_pause(format!("rate limited ({model}): {message}"), now + backoff);
        self.persist()
    }

    /// Overwrite local estimates with externally observed percentages.
    /// Pauses when the external meter says the window is exhausted.
    pub fn sync_with_actual_usage(
        &mut self,
        five_hour_pct: f64,
        weekly_pct: f64,
    ) -> Result<(), StateError> {
        let now = Utc::now();
        self.state.last_sync_at = Some(now);
        self.state.synced_five_hour_pct = Some(five_hour_pct);
        self.state.synced_weekly_pct = Some(weekly_pct);
        if five_hour_pct >= 100.0 {
            self.set_pause("provider reports 5-hour window exhausted".into(), now + self.config.hit_pause);
        } else if weekly_pct >= 100.0 {
            self.set_pause(
                "provider reports weekly window exhausted".into(),
                now + Duration::hours(6),
            );
        }
        self.persist()
    }

    fn set_pause(&mut self, reason: String, until: DateTime<Utc>) {
        // Never shorten an existing pause.
        if self.state.paused_until.is_none_or(|u| until > u) {
            self.state.paused_until = Some(until);
            self.state.pause_reason = Some(reason);
        }
    }

    /// Explicit operator pause.
    pub fn pause(&mut self, reason: &str, until: DateTime<Utc>) -> Result<(), StateError> {
        self.set_pause(reason.to_owned(), until);
        self.persist()
    }

    /// Pause is active iff pause-until is in the future.
    pub fn is_paused(&self) -> bool {
        self.state.paused_until.is_some_and(|u| u > Utc::now())
    }

    /// Lift an expired pause. Returns `true` if the pause was lifted by
    /// this call.
    pub fn check_auto_resume(&mut self) -> Result<bool, StateError> {
        if let Some(until) = self.state.paused_until {
            if until <= Utc::now() {
                self.state.paused_until = None;
                self.state.pause_reason = None;
                self.persist()?;
                tracing::info!("rate-limit pause expired, resuming");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn pause_reason(&self) -> Option<&str> {
        self.state.pause_reason.as_deref()
    }

    /// Summary for `undercity usage` and the end-of-grind report.
    ///
    /// The synced percentage wins while it is fresher than ten minutes;
    /// otherwise the locally estimated window fraction is reported.
    pub fn usage_summary(&self) -> UsageSummary {
        let now = Utc::now();
        let local_five =
            percent(self.window_tokens(now, Duration::hours(5)), self.config.five_hour_token_limit);
        let local_week =
            percent(self.window_tokens(now, Duration::days(7)), self.config.weekly_token_limit);

        let sync_fresh = self
            .state
            .last_sync_at
            .is_some_and(|at| now - at < Duration::minutes(10));
        let five_hour_pct = if sync_fresh {
            self.state.synced_five_hour_pct.unwrap_or(local_five)
        } else {
            local_five
        };
        let weekly_pct = if sync_fresh {
            self.state.synced_weekly_pct.unwrap_or(local_week)
        } else {
            local_week
        };

        let cutoff = now - Duration::days(7);
        let mut per_model: BTreeMap<ModelTier, (u64, u64)> = BTreeMap::new();
        for s in self.state.samples.iter().filter(|s| s.at >= cutoff) {
            let slot = per_model.entry(s.model).or_default();
            slot.0 += s.input_tokens;
            slot.1 += s.output_tokens;
        }

        UsageSummary {
            five_hour_pct,
            weekly_pct,
            per_model,
            rate_limit_hits: self.state.rate_limit_hits,
            paused_until: self.state.paused_until,
            pause_reason: self.state.pause_reason.clone(),
        }
    }
}

fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    used as f64 / limit as f64 * 100.0
}
