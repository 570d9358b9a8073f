//! Bookkeeping trackers owned by the orchestrator: per-task file accesses
//! with conflict prediction, and rolling rate-limit/budget windows.

pub mod files;
pub mod rate_limit;

pub use files::{AccessKind, FileTracker};
pub use rate_limit::{RateLimitConfig, RateLimitTracker, UsageSummary};
