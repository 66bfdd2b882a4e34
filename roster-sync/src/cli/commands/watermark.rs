//! Watermark command handler

use std::path::Path;

use anyhow::Result;
use chrono::DateTime;
use colored::*;

use super::WatermarkCommands;
use roster_sync::pipeline::{SqliteWatermarkStore, WatermarkStore};
use roster_sync::settings::Settings;

pub async fn handle_watermark_command(command: WatermarkCommands, settings_path: Option<&Path>) -> Result<()> {
    let mut settings = Settings::load(settings_path)?;
    settings.apply_env()?;
    let path = settings.watermark_path();
    let store = SqliteWatermarkStore::open(&path).await?;

    match command {
        WatermarkCommands::Get { domain } => match store.get(&domain).await? {
            Some(cursor) => println!("{} {}", domain.bright_cyan(), cursor),
            None => println!("{} {}", domain.bright_cyan(), "(none, next sync is a full sync)".dimmed()),
        },
        WatermarkCommands::Set { domain, cursor } => {
            if DateTime::parse_from_rfc3339(&cursor).is_err() {
                println!(
                    "{} '{}' is not an RFC 3339 timestamp; the source must understand it as a since value",
                    "⚠".yellow(),
                    cursor
                );
            }
            store.set(&domain, &cursor).await?;
            log::info!("Watermark for '{}' set to {} by hand", domain, cursor);
            println!("{} {} -> {}", "✓".bright_green().bold(), domain.bright_cyan(), cursor);
        }
        WatermarkCommands::List => {
            let rows = store.list().await?;
            if rows.is_empty() {
                println!("{}", format!("No watermarks in {}", path.display()).dimmed());
            }
            for (domain, cursor, updated_at) in rows {
                println!(
                    "{:<20} {:<32} {}",
                    domain.bright_cyan(),
                    cursor,
                    format!("updated {}", updated_at).dimmed()
                );
            }
        }
    }

    Ok(())
}
