//! Configuration resolution for the `undercity` binary.
//!
//! Project-scoped TOML config at `.undercity/config.toml`, resolved with
//! the chain: CLI flag > environment variable > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use undercity_core::agent::command::{CommandAgentRunner, AGENT_CMD_ENV};
use undercity_state::layout::StateLayout;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub grind: GrindSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent command line, e.g. `claude -p --model {model}`.
    pub command: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GrindSection {
    pub max_concurrent: Option<usize>,
    pub starting_model: Option<String>,
    pub push_on_success: Option<bool>,
    pub review_passes: Option<bool>,
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Find the repository root: explicit flag, else the enclosing git
/// toplevel of the current directory.
pub fn resolve_repo_root(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let toplevel = undercity_core::git::git(&cwd, &["rev-parse", "--show-toplevel"])
        .context("not inside a git repository (pass --repo)")?;
    Ok(PathBuf::from(toplevel))
}

/// Load the project config file; a missing file is an empty config.
pub fn load_config(layout: &StateLayout) -> Result<ConfigFile> {
    let path = layout.config_file();
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Resolve the agent runner: `--agent-cmd` flag > `UNDERCITY_AGENT_CMD` >
/// config file > default (`claude -p --model {model}`).
pub fn resolve_runner(flag: Option<&str>, config: &ConfigFile) -> CommandAgentRunner {
    if let Some(cmd) = flag {
        if let Some(runner) = CommandAgentRunner::from_command_line(cmd) {
            return runner;
        }
    }
    if let Ok(cmd) = std::env::var(AGENT_CMD_ENV) {
        if let Some(runner) = CommandAgentRunner::from_command_line(&cmd) {
            return runner;
        }
    }
    if let Some(cmd) = config.agent.command.as_deref() {
        if let Some(runner) = CommandAgentRunner::from_command_line(cmd) {
            return runner;
        }
    }
    CommandAgentRunner::new()
}
