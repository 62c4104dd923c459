//! Maintenance commands for the stored conversation trees.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier::{SnapshotSummary, restore_manager, tree_store};
use courier_core::logging::init_subscriber;
use courier_settings::{load_settings, load_settings_from_path};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "courier", about = "Inspect and repair stored conversation trees")]
struct Cli {
    /// Settings file (defaults to the data directory's `settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print tree and node counts of the stored snapshot.
    Inspect {
        /// Snapshot file to read instead of the configured one.
        #[arg(long)]
        trees: Option<PathBuf>,
    },
    /// Fail nodes left unfinished by a previous run and save the result.
    Reconcile {
        /// Snapshot file to repair instead of the configured one.
        #[arg(long)]
        trees: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => load_settings().context("failed to load settings")?,
    };
    init_subscriber(&settings.logging.level, settings.logging.format);

    match cli.command {
        Command::Inspect { trees } => {
            let store = tree_store(&settings, trees);
            let snapshot = store.load()?.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&SnapshotSummary::of(&snapshot))?);
        }
        Command::Reconcile { trees } => {
            let store = tree_store(&settings, trees);
            let restored = restore_manager(&store)
                .with_context(|| format!("failed to reconcile {}", store.path().display()))?;
            let report = json!({
                "trees": restored.manager.tree_count(),
                "stale": restored.stale,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
