//! `undercity tasks`: list the board.

use anyhow::Result;
use clap::Args;
use uuid::Uuid;

use undercity_state::board::{TaskBoard, TaskFilter};
use undercity_state::layout::StateLayout;
use undercity_state::models::TaskStatus;

use crate::EXIT_OK;

#[derive(Debug, Args)]
pub struct TasksArgs {
    /// Filter by status (pending, in_progress, complete, failed, blocked,
    /// decomposed)
    #[arg(long)]
    status: Option<TaskStatus>,
    /// Filter by tag
    #[arg(long)]
    tag: Option<String>,
    /// Filter by parent task
    #[arg(long)]
    parent: Option<Uuid>,
    /// Emit JSON instead of the table
    #[arg(long)]
    json: bool,
}

pub fn run(layout: &StateLayout, args: TasksArgs) -> Result<u8> {
    let board = TaskBoard::open(layout.tasks_file())?;
    let filter = TaskFilter {
        status: args.status,
        tag: args.tag,
        parent_id: args.parent,
    };
    let tasks = board.list(&filter);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(EXIT_OK);
    }

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(EXIT_OK);
    }
    for task in tasks {
        let short_id = &task.id.to_string()[..8];
        let marker = if task.is_decomposed { "*" } else { " " };
        println!(
            "{short_id}{marker} [{:>11}] p{:<4} {}",
            task.status.to_string(),
            task.priority,
            task.objective
        );
        if let Some(error) = &task.last_error {
            let first = error.lines().next().unwrap_or("");
            println!("           error: {first}");
        }
    }
    Ok(EXIT_OK)
}
