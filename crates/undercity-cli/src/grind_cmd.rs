//! `undercity grind`: run batches until the board drains or a gate trips.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use undercity_core::orchestrator::{GrindOptions, GrindSummary, Orchestrator};
use undercity_state::layout::StateLayout;
use undercity_state::models::ModelTier;

use crate::config;
use crate::{EXIT_EMERGENCY, EXIT_OK, EXIT_RATE_LIMITED};

#[derive(Debug, Args)]
pub struct GrindArgs {
    /// Concurrent workers (hard cap 5)
    #[arg(long, short = 'j')]
    parallelism: Option<usize>,
    /// Stop after processing this many tasks
    #[arg(long)]
    count: Option<usize>,
    /// Starting model tier (haiku, sonnet, opus)
    #[arg(long)]
    model: Option<ModelTier>,
    /// Push mainline to origin after each successful merge
    #[arg(long)]
    push: bool,
    /// Fail NEEDS_DECOMPOSITION refusals instead of splitting the task
    #[arg(long)]
    no_decompose: bool,
    /// Skip review passes after a green verify
    #[arg(long)]
    no_review: bool,
    /// Fix attempts per tier before escalation
    #[arg(long)]
    verify_retries: Option<u32>,
    /// Select the batch and exit without running anything
    #[arg(long)]
    dry_run: bool,
    /// Agent command line (overrides env and config)
    #[arg(long)]
    agent_cmd: Option<String>,
}

pub async fn run(repo_root: PathBuf, layout: &StateLayout, args: GrindArgs) -> Result<u8> {
    let file = config::load_config(layout)?;
    let runner = Arc::new(config::resolve_runner(args.agent_cmd.as_deref(), &file));

    let defaults = GrindOptions::default();
    let options = GrindOptions {
        max_concurrent: args
            .parallelism
            .or(file.grind.max_concurrent)
            .unwrap_or(defaults.max_concurrent),
        max_tasks: args.count,
        starting_model: args
            .model
            .or_else(|| {
                file.grind
                    .starting_model
                    .as_deref()
                    .and_then(|s| s.parse().ok())
            })
            .unwrap_or(defaults.starting_model),
        push_on_success: args.push || file.grind.push_on_success.unwrap_or(false),
        decompose_enabled: !args.no_decompose,
        review_passes: !args.no_review && file.grind.review_passes.unwrap_or(true),
        dry_run: args.dry_run,
        max_retries_per_tier: args.verify_retries.unwrap_or(defaults.max_retries_per_tier),
        ..defaults
    };

    let mut orchestrator = Orchestrator::new(repo_root, runner, options)?;
    let summary = orchestrator.grind().await?;
    print_summary(&summary);

    if summary.emergency {
        Ok(EXIT_EMERGENCY)
    } else if summary.rate_limited {
        Ok(EXIT_RATE_LIMITED)
    } else {
        Ok(EXIT_OK)
    }
}

fn print_summary(summary: &GrindSummary) {
    if !summary.dry_run_selected.is_empty() {
        println!("Dry run; would admit {} task(s):", summary.dry_run_selected.len());
        for objective in &summary.dry_run_selected {
            println!("  - {objective}");
        }
        return;
    }

    println!(
        "Grind finished: {} processed in {} batch(es) over {:.1}s",
        summary.processed,
        summary.batches,
        summary.duration_ms as f64 / 1000.0
    );
    println!(
        "  complete: {}  merged: {}  failed: {}  decomposed: {}  parked: {}  deferred: {}",
        summary.completed,
        summary.merged,
        summary.failed,
        summary.decomposed,
        summary.parked,
        summary.deferred
    );
    if !summary.by_category.is_empty() {
        println!("  failures by category:");
        for (category, count) in &summary.by_category {
            println!("    {category}: {count}");
        }
    }
    if !summary.model_distribution.is_empty() {
        let dist: Vec<String> = summary
            .model_distribution
            .iter()
            .map(|(tier, count)| format!("{tier}={count}"))
            .collect();
        println!("  model distribution: {} (opus starts: {})", dist.join(" "), summary.opus_started);
    }
    if let Some(usage) = &summary.usage {
        println!(
            "  usage: {:.1}% of 5h window, {:.1}% of weekly window",
            usage.five_hour_pct, usage.weekly_pct
        );
    }
    if summary.rate_limited {
        println!("  stopped: rate-limit pause active");
    }
    if summary.emergency {
        println!("  stopped: EMERGENCY MODE active (see `undercity emergency --status`)");
    }
}
