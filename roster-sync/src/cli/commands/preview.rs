//! Preview command handler: offline transform of a JSON file

use anyhow::{Context, Result};
use colored::*;
use serde_json::Value as Json;

use super::{PreviewArgs, load_mapping, object_filter};
use roster_sync::pipeline::MemoryTarget;
use roster_sync::transform::{IdentityResolver, RecordTransformer};

pub async fn handle_preview_command(args: PreviewArgs) -> Result<()> {
    let filter = object_filter(args.object, Vec::new(), None);
    let mapping = load_mapping(&args.mapping, &filter)?;

    let content = std::fs::read_to_string(&args.input)
        .with_context(|| format!("Failed to read input file: {}", args.input.display()))?;
    let records = match serde_json::from_str::<Json>(&content)
        .with_context(|| format!("Input is not valid JSON: {}", args.input.display()))?
    {
        Json::Array(records) => records,
        record @ Json::Object(_) => vec![record],
        _ => anyhow::bail!("Input must be a JSON array of records or a single record"),
    };

    // No target: every record is new, native ids stay unset
    let ids = IdentityResolver::build(&mapping, &filter, &records, &MemoryTarget::new()).await?;
    let output = RecordTransformer::new(&mapping, &ids).transform(&records, &filter)?;

    for (object, built) in &output {
        eprintln!(
            "{} {} {}",
            "•".bright_blue(),
            object.bright_white().bold(),
            format!("({} records)", built.len()).dimmed()
        );
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to render output records")?
    );
    Ok(())
}
