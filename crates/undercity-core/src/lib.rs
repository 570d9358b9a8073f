//! Orchestration engine for the undercity grid.
//!
//! The orchestrator admits tasks from the board into a bounded worker
//! pool, gives each worker an isolated git worktree, drives the external
//! coding agent through a tiered escalation state machine, and funnels
//! successful branches through a serial rebase-verify-merge queue into
//! mainline. Everything durable lives in `undercity-state`; this crate
//! owns the moving parts.

pub mod agent;
pub mod emergency;
pub mod git;
pub mod guidance;
pub mod health;
pub mod merge;
pub mod orchestrator;
pub mod tracker;
pub mod verify;
pub mod worker;
pub mod worktree;
