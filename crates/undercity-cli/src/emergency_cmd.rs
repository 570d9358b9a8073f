//! `undercity emergency`: inspect or operate the kill switch.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use undercity_core::emergency::{mainline_health_check, EmergencyMode};
use undercity_core::verify::VerifyRunner;
use undercity_state::layout::StateLayout;

use crate::{EXIT_EMERGENCY, EXIT_OK};

#[derive(Debug, Args)]
pub struct EmergencyArgs {
    /// Show emergency state (default)
    #[arg(long)]
    status: bool,
    /// Run the mainline health check now and update the flag
    #[arg(long)]
    check: bool,
    /// Clear the flag (human override)
    #[arg(long)]
    clear: bool,
}

pub async fn run(repo_root: PathBuf, layout: &StateLayout, args: EmergencyArgs) -> Result<u8> {
    let mut emergency = EmergencyMode::open(layout)?;

    if args.clear {
        emergency.clear()?;
        println!("Emergency mode cleared.");
        return Ok(EXIT_OK);
    }

    if args.check {
        let verify = VerifyRunner::detect(&repo_root);
        if verify.is_empty() {
            println!("No verification commands detected for this project; nothing to check.");
        } else {
            let report = mainline_health_check(&verify, &repo_root).await?;
            if report.passed() {
                println!("Mainline health check passed.");
                if emergency.state().active {
                    emergency.clear()?;
                    println!("Emergency mode cleared.");
                }
            } else {
                let reason = format!(
                    "mainline health check failed: {}",
                    report
                        .failure_kind()
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| "unknown".into())
                );
                emergency.activate(&reason)?;
                println!("{reason}");
                println!("{}", report.failure_summary(1024));
                return Ok(EXIT_EMERGENCY);
            }
        }
        return Ok(EXIT_OK);
    }

    // Default: status.
    let state = emergency.state();
    if state.active {
        println!("EMERGENCY MODE ACTIVE");
        println!("  reason: {}", state.reason.as_deref().unwrap_or("(none)"));
        if let Some(at) = state.activated_at {
            println!("  since: {at}");
        }
        println!("  automatic fix attempts: {}", state.fix_attempts);
        return Ok(EXIT_EMERGENCY);
    }
    println!("Emergency mode inactive.");
    Ok(EXIT_OK)
}
