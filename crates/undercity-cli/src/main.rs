mod add_cmd;
mod config;
mod drain_cmd;
mod emergency_cmd;
mod grind_cmd;
mod human_input_cmd;
mod status_cmd;
mod tasks_cmd;
mod usage_cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use undercity_state::layout::StateLayout;

/// Exit codes: 0 success, 1 runtime failure, 2 rate-limit pause,
/// 3 emergency mode active.
pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_RATE_LIMITED: u8 = 2;
pub const EXIT_EMERGENCY: u8 = 3;

#[derive(Parser)]
#[command(name = "undercity", about = "Autonomous coding-agent grid")]
struct Cli {
    /// Repository root (defaults to the enclosing git toplevel)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run batches of tasks from the board until it drains or a gate trips
    Grind(grind_cmd::GrindArgs),
    /// Add a task to the board
    Add(add_cmd::AddArgs),
    /// List tasks on the board
    Tasks(tasks_cmd::TasksArgs),
    /// Show board, batch, and emergency status
    Status {
        /// Emit JSON instead of the human summary
        #[arg(long)]
        json: bool,
    },
    /// Signal a running grind to stop admitting new batches
    Drain {
        /// Lift a previously requested drain instead
        #[arg(long)]
        lift: bool,
    },
    /// Inspect or operate the emergency kill switch
    Emergency(emergency_cmd::EmergencyArgs),
    /// Show token usage and rate-limit state
    Usage {
        /// Emit JSON instead of the human summary
        #[arg(long)]
        json: bool,
    },
    /// Review failures awaiting guidance, provide it, or retry
    HumanInput(human_input_cmd::HumanInputArgs),
    /// Generate shell completions
    Completions {
        /// Shell to generate for
        shell: clap_complete::Shell,
    },
}

fn init_tracing(layout: &StateLayout) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Mirror to the tailable log for dashboards; best effort.
    let file_layer = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(layout.current_log_file())
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
        });

    let registry = tracing_subscriber::registry().with(filter).with(stderr_layer);
    if let Some(file_layer) = file_layer {
        registry.with(file_layer).init();
    } else {
        registry.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(*shell, &mut cmd, name, &mut std::io::stdout());
        return ExitCode::from(EXIT_OK);
    }

    let repo_root = match config::resolve_repo_root(cli.repo.clone()) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let layout = StateLayout::for_project(&repo_root);
    if let Err(e) = layout.ensure() {
        eprintln!("error: {e:#}");
        return ExitCode::from(EXIT_FAILURE);
    }
    init_tracing(&layout);

    let result = match cli.command {
        Commands::Grind(args) => grind_cmd::run(repo_root, &layout, args).await,
        Commands::Add(args) => add_cmd::run(&layout, args),
        Commands::Tasks(args) => tasks_cmd::run(&layout, args),
        Commands::Status { json } => status_cmd::run(&layout, json),
        Commands::Drain { lift } => drain_cmd::run(&layout, lift),
        Commands::Emergency(args) => emergency_cmd::run(repo_root, &layout, args).await,
        Commands::Usage { json } => usage_cmd::run(&layout, json),
        Commands::HumanInput(args) => human_input_cmd::run(&layout, args),
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
