//! Command arguments and handlers

pub mod preview;
pub mod sync;
pub mod validate;
pub mod watermark;

use std::path::PathBuf;

use clap::{Args, Subcommand};
use roster_sync::mapping::{MappingConfig, ObjectFilter};

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Mapping file (TOML)
    #[arg(short, long)]
    pub mapping: PathBuf,

    /// Build only these target objects (repeatable)
    #[arg(long)]
    pub object: Vec<String>,

    /// Never build these target objects (repeatable)
    #[arg(long)]
    pub exclude: Vec<String>,

    /// Only build objects fed by this source system
    #[arg(long)]
    pub source: Option<String>,

    /// Stop after this many source records
    #[arg(long)]
    pub limit: Option<usize>,

    /// Upsert into memory instead of Dynamics; the watermark is not touched
    #[arg(long)]
    pub dry_run: bool,

    /// Ignore the stored watermark and sync everything
    #[arg(long)]
    pub full: bool,
}

#[derive(Args, Debug)]
pub struct PreviewArgs {
    /// Mapping file (TOML)
    #[arg(short, long)]
    pub mapping: PathBuf,

    /// JSON file holding an array of source records
    #[arg(short, long)]
    pub input: PathBuf,

    /// Build only these target objects (repeatable)
    #[arg(long)]
    pub object: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Mapping file (TOML)
    #[arg(short, long)]
    pub mapping: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum WatermarkCommands {
    /// Show the watermark of a domain
    Get { domain: String },
    /// Overwrite the watermark of a domain
    Set { domain: String, cursor: String },
    /// List all stored watermarks
    List,
}

/// Load a mapping and check the object selection against it
fn load_mapping(path: &std::path::Path, filter: &ObjectFilter) -> anyhow::Result<MappingConfig> {
    if !path.exists() {
        anyhow::bail!("Mapping file does not exist: {}", path.display());
    }
    let mapping = MappingConfig::load(path)?;
    mapping.check_filter(filter)?;
    Ok(mapping)
}

fn object_filter(only: Vec<String>, exclude: Vec<String>, source: Option<String>) -> ObjectFilter {
    ObjectFilter {
        source,
        only: only.into_iter().collect(),
        exclude: exclude.into_iter().collect(),
    }
}
