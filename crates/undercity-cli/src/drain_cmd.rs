//! `undercity drain`: cooperative shutdown signal.
//!
//! Drops (or lifts) the drain marker file. A running grind checks the
//! marker before each admission: no new batches start, in-flight workers
//! finish.

use anyhow::{Context, Result};

use undercity_state::layout::StateLayout;

use crate::EXIT_OK;

pub fn run(layout: &StateLayout, lift: bool) -> Result<u8> {
    let marker = layout.drain_file();
    if lift {
        match std::fs::remove_file(&marker) {
            Ok(()) => println!("Drain lifted."),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                println!("No drain was requested.");
            }
            Err(e) => return Err(e).context("failed to remove drain marker"),
        }
        return Ok(EXIT_OK);
    }

    std::fs::write(&marker, b"drain\n").context("failed to write drain marker")?;
    println!("Drain requested: no new batches will be admitted; in-flight workers will finish.");
    Ok(EXIT_OK)
}
