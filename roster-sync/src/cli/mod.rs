//! Command-line interface

pub mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{PreviewArgs, SyncArgs, ValidateArgs, WatermarkCommands};

#[derive(Parser, Debug)]
#[command(name = "roster-sync")]
#[command(version, about = "Sync HR records into Microsoft Dynamics 365", long_about = None)]
pub struct Cli {
    /// Settings file (default: ~/.config/roster-sync/settings.toml)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an incremental sync from the HR source into Dynamics
    Sync(SyncArgs),
    /// Transform a JSON file of source records and print the output records
    Preview(PreviewArgs),
    /// Load and validate a mapping, printing the object build order
    Validate(ValidateArgs),
    /// Inspect or edit persisted watermarks
    Watermark {
        #[command(subcommand)]
        command: WatermarkCommands,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    if cli.no_color {
        colored::control::set_override(false);
    }

    match cli.command {
        Commands::Sync(args) => commands::sync::handle_sync_command(args, cli.settings.as_deref()).await,
        Commands::Preview(args) => commands::preview::handle_preview_command(args).await,
        Commands::Validate(args) => commands::validate::handle_validate_command(args),
        Commands::Watermark { command } => {
            commands::watermark::handle_watermark_command(command, cli.settings.as_deref()).await
        }
    }
}
