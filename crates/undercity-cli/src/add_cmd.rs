//! `undercity add`: put a task on the board.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use uuid::Uuid;

use undercity_state::board::TaskBoard;
use undercity_state::events::{Event, EventLog};
use undercity_state::layout::StateLayout;
use undercity_state::models::{Task, Ticket};

use crate::EXIT_OK;

#[derive(Debug, Args)]
pub struct AddArgs {
    /// What to build
    objective: String,
    /// Higher runs first
    #[arg(long, short = 'p', default_value_t = 0)]
    priority: i32,
    /// Tags (repeatable)
    #[arg(long)]
    tag: Vec<String>,
    /// Parent task id (registers this as a subtask)
    #[arg(long)]
    parent: Option<Uuid>,
    /// Files the task is expected to touch (repeatable)
    #[arg(long = "file")]
    files: Vec<String>,
    /// Longer ticket description
    #[arg(long)]
    description: Option<String>,
    /// Acceptance criteria (repeatable)
    #[arg(long = "criterion")]
    criteria: Vec<String>,
}

pub fn run(layout: &StateLayout, args: AddArgs) -> Result<u8> {
    let mut board = TaskBoard::open(layout.tasks_file())?;

    let mut task = Task::new(args.objective.clone(), args.priority);
    task.tags = args.tag;
    task.parent_id = args.parent;
    if !args.files.is_empty() {
        task.estimated_files = Some(args.files);
    }
    if args.description.is_some() || !args.criteria.is_empty() {
        task.ticket = Some(Ticket {
            description: args.description.unwrap_or_default(),
            acceptance_criteria: args.criteria,
            test_plan: None,
            rationale: None,
        });
    }

    let id = board.add(task).context("failed to add task")?;
    EventLog::new(layout.events_file()).append(&Event::TaskQueued {
        task_id: id,
        objective: args.objective,
        priority: args.priority,
        at: Utc::now(),
    })?;

    println!("{id}");
    Ok(EXIT_OK)
}
