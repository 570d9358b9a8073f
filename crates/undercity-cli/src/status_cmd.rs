//! `undercity status`: one-screen view of the grid.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use undercity_core::emergency::EmergencyMode;
use undercity_core::tracker::rate_limit::{RateLimitConfig, RateLimitTracker};
use undercity_state::board::{TaskBoard, TaskFilter};
use undercity_state::layout::StateLayout;
use undercity_state::models::ActiveTaskState;
use undercity_state::recovery::RecoveryStore;

use crate::EXIT_OK;

#[derive(Debug, Serialize)]
struct Status {
    board: BTreeMap<String, usize>,
    active: Vec<ActiveView>,
    emergency_active: bool,
    emergency_reason: Option<String>,
    paused: bool,
    pause_reason: Option<String>,
    drain_requested: bool,
}

#[derive(Debug, Serialize)]
struct ActiveView {
    task_id: String,
    objective: String,
    model: String,
    branch: String,
}

fn active_view(state: &ActiveTaskState) -> ActiveView {
    ActiveView {
        task_id: state.task_id.to_string(),
        objective: state.objective.clone(),
        model: state.model.to_string(),
        branch: state.branch.clone(),
    }
}

pub fn run(layout: &StateLayout, json: bool) -> Result<u8> {
    let board = TaskBoard::open(layout.tasks_file())?;
    let recovery = RecoveryStore::open(layout)?;
    let emergency = EmergencyMode::open(layout)?;
    let rate_limit = RateLimitTracker::open(layout, RateLimitConfig::default())?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for task in board.list(&TaskFilter::default()) {
        *counts.entry(task.status.to_string()).or_default() += 1;
    }
    let active: Vec<ActiveView> = recovery
        .scan_active_tasks()?
        .iter()
        .map(active_view)
        .collect();

    let status = Status {
        board: counts,
        active,
        emergency_active: emergency.state().active,
        emergency_reason: emergency.state().reason.clone(),
        paused: rate_limit.is_paused(),
        pause_reason: rate_limit.pause_reason().map(str::to_owned),
        drain_requested: layout.drain_file().exists(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(EXIT_OK);
    }

    println!("Board:");
    if status.board.is_empty() {
        println!("  (empty)");
    }
    for (state, count) in &status.board {
        println!("  {state}: {count}");
    }
    if status.active.is_empty() {
        println!("In flight: none");
    } else {
        println!("In flight:");
        for task in &status.active {
            println!(
                "  {} [{}] {}",
                &task.task_id[..8],
                task.model,
                task.objective
            );
        }
    }
    if status.emergency_active {
        println!(
            "EMERGENCY MODE: {}",
            status.emergency_reason.as_deref().unwrap_or("(no reason)")
        );
    }
    if status.paused {
        println!(
            "Rate-limit pause: {}",
            status.pause_reason.as_deref().unwrap_or("(no reason)")
        );
    }
    if status.drain_requested {
        println!("Drain requested.");
    }
    Ok(EXIT_OK)
}
