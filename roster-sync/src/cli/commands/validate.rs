//! Validate command handler

use anyhow::Result;
use colored::*;

use super::{ValidateArgs, load_mapping};
use roster_sync::mapping::ObjectFilter;

pub fn handle_validate_command(args: ValidateArgs) -> Result<()> {
    let mapping = load_mapping(&args.mapping, &ObjectFilter::all())?;

    println!(
        "{} mapping '{}' ({} objects, source '{}')",
        "✓".bright_green().bold(),
        mapping.domain.bright_cyan(),
        mapping.order().len(),
        mapping.source
    );
    println!();
    println!("{}", "Build order:".bold());

    for (i, object) in mapping.objects().enumerate() {
        let kind = if object.flat { "flat" } else { "branched" };
        let mut deps: Vec<&str> = object
            .self_paths()
            .map(|p| p.head())
            .filter(|head| *head != object.name && mapping.object(head).is_some())
            .collect();
        deps.sort_unstable();
        deps.dedup();

        println!(
            "  {}. {} ({}, key {}, native {})",
            i + 1,
            object.name.bright_white().bold(),
            kind,
            object.target_id_field().cyan(),
            object.native_id_field().dimmed()
        );
        if !deps.is_empty() {
            println!("     depends on {}", deps.join(", ").yellow());
        }
        for (field, rule) in &object.fields {
            println!("     {} <- {}", field, rule.describe().dimmed());
        }
    }

    Ok(())
}
