//! `undercity human-input`: the escape hatch for tasks the grid cannot
//! crack on its own.
//!
//! `--list` shows failure signatures awaiting guidance, `--provide`
//! attaches guidance to one, and `--retry` requeues every parked task
//! whose signature now has guidance (folded into the task's handoff
//! context).

use anyhow::{bail, Result};
use clap::Args;

use undercity_core::guidance::{HumanGuidanceStore, NEEDS_HUMAN_INPUT_TAG};
use undercity_state::board::TaskBoard;
use undercity_state::layout::StateLayout;
use undercity_state::models::{HandoffContext, TaskStatus};

use crate::EXIT_OK;

#[derive(Debug, Args)]
pub struct HumanInputArgs {
    /// List failure signatures awaiting guidance (default)
    #[arg(long)]
    list: bool,
    /// Attach guidance to a signature: --provide <signature> <guidance>
    #[arg(long, num_args = 2, value_names = ["SIGNATURE", "GUIDANCE"])]
    provide: Option<Vec<String>>,
    /// Requeue parked tasks whose signatures have guidance
    #[arg(long)]
    retry: bool,
}

pub fn run(layout: &StateLayout, args: HumanInputArgs) -> Result<u8> {
    let mut store = HumanGuidanceStore::open(layout)?;

    if let Some(provide) = args.provide {
        let [signature, guidance] = provide.as_slice() else {
            bail!("--provide takes exactly a signature and a guidance string");
        };
        store.provide(signature, guidance)?;
        println!("Guidance recorded for {signature}. Run with --retry to requeue.");
        return Ok(EXIT_OK);
    }

    if args.retry {
        let mut board = TaskBoard::open(layout.tasks_file())?;
        let mut requeued = 0usize;
        for entry in store.resolved() {
            let guidance = entry.guidance.clone().unwrap_or_default();
            for task_id in &entry.task_ids {
                let Some(task) = board.get(*task_id) else { continue };
                if task.status != TaskStatus::Blocked {
                    continue;
                }
                board.set_handoff(
                    *task_id,
                    HandoffContext {
                        prior_attempt_summary: Some(entry.error_excerpt.clone()),
                        human_guidance: Some(guidance.clone()),
                        retry: true,
                    },
                )?;
                board.update_status(*task_id, TaskStatus::Pending, None)?;
                requeued += 1;
            }
        }
        println!("Requeued {requeued} task(s) with guidance.");
        return Ok(EXIT_OK);
    }

    // Default: list.
    let pending = store.pending();
    if pending.is_empty() {
        println!("No failures awaiting guidance.");
        return Ok(EXIT_OK);
    }
    println!("Failures awaiting guidance (tag: {NEEDS_HUMAN_INPUT_TAG}):");
    for entry in pending {
        println!(
            "  {}  x{}  {} task(s)",
            entry.signature,
            entry.occurrences,
            entry.task_ids.len()
        );
        let excerpt = entry.error_excerpt.lines().next().unwrap_or("");
        println!("    {excerpt}");
    }
    println!("\nProvide guidance with: undercity human-input --provide <signature> \"<text>\"");
    Ok(EXIT_OK)
}
