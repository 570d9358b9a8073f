//! `undercity usage`: token usage and rate-limit state.

use anyhow::Result;

use undercity_core::tracker::rate_limit::{RateLimitConfig, RateLimitTracker};
use undercity_state::layout::StateLayout;

use crate::EXIT_OK;

pub fn run(layout: &StateLayout, json: bool) -> Result<u8> {
    let tracker = RateLimitTracker::open(layout, RateLimitConfig::default())?;
    let summary = tracker.usage_summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(EXIT_OK);
    }

    println!(
        "5-hour window: {:.1}%   weekly window: {:.1}%",
        summary.five_hour_pct, summary.weekly_pct
    );
    if summary.per_model.is_empty() {
        println!("No recorded usage this week.");
    } else {
        println!("Per model (7 days):");
        for (tier, (input, output)) in &summary.per_model {
            println!("  {tier}: {input} in / {output} out tokens");
        }
    }
    if summary.rate_limit_hits > 0 {
        println!("Rate-limit hits: {}", summary.rate_limit_hits);
    }
    if let Some(until) = summary.paused_until {
        println!(
            "Paused until {until} ({})",
            summary.pause_reason.as_deref().unwrap_or("no reason")
        );
    }
    Ok(EXIT_OK)
}
