//! Thin wrapper over the `git` plumbing commands the engine relies on.
//!
//! Only plumbing is used (`worktree`, `fetch`, `rebase`, `merge --ff-only`,
//! `diff --name-only`, `status --porcelain`, `rev-parse`, `push`). Refs
//! passed to these helpers must already be validated by the caller; see
//! [`crate::worktree::validate_ref`].

use std::path::Path;
use std::process::{Command, Output};

use thiserror::Error;

/// Errors from running a git command.
#[derive(Debug, Error)]
pub enum GitError {
    /// The `git` binary could not be executed at all.
    #[error("failed to run git {command}: {source}")]
    Run {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Git ran and exited non-zero.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Run a git command in `dir`, returning the raw output regardless of the
/// exit status.
pub fn git_output(dir: &Path, args: &[&str]) -> Result<Output, GitError> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| GitError::Run {
            command: args.join(" "),
            source: e,
        })
}

/// Run a git command in `dir` and return trimmed stdout; non-zero exit is
/// an error.
pub fn git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = git_output(dir, args)?;
    if !output.status.success() {
        return Err(GitError::Exit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a git command in `dir` and report only whether it succeeded.
pub fn git_ok(dir: &Path, args: &[&str]) -> Result<bool, GitError> {
    Ok(git_output(dir, args)?.status.success())
}
