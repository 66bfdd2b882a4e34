//! Sync command handler

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::*;

use super::{SyncArgs, load_mapping, object_filter};
use roster_sync::clients::{DataverseTarget, HttpSource};
use roster_sync::pipeline::{
    MemoryTarget, MemoryWatermarkStore, PressureGate, RunContext, RunSummary, SqliteWatermarkStore,
    SyncOrchestrator, SystemMemoryGauge, TargetStore, WatermarkStore,
};
use roster_sync::settings::Settings;

pub async fn handle_sync_command(args: SyncArgs, settings_path: Option<&Path>) -> Result<()> {
    let mut settings = Settings::load(settings_path)?;
    settings.apply_env()?;

    let filter = object_filter(args.object, args.exclude, args.source);
    let mapping = load_mapping(&args.mapping, &filter)?;
    let domain = mapping.domain.clone();

    let mut sync_settings = settings.sync_settings();
    if args.limit.is_some() {
        sync_settings.record_limit = args.limit;
    }
    let gate = PressureGate::new(
        Arc::new(SystemMemoryGauge::new()),
        sync_settings.backpressure.clone(),
    );
    let ctx = RunContext::new(mapping, filter, sync_settings)?.with_full_resync(args.full);

    let env = |key: &str| std::env::var(key).ok();
    let mut source = HttpSource::new(settings.source.clone(), settings.source_token(env))
        .context("Failed to set up the HR source")?;
    let watermark_path = settings.watermark_path();

    println!(
        "{} {} for '{}'{}",
        "→".bright_blue(),
        if args.dry_run { "Dry run" } else { "Sync" },
        domain.bright_cyan(),
        if args.full { " (full)".yellow().to_string() } else { String::new() }
    );

    if args.dry_run {
        // Start from the real watermark, but never advance it
        let watermarks = match dry_run_cursor(&watermark_path, &domain).await? {
            Some(cursor) => MemoryWatermarkStore::with_cursor(&domain, &cursor),
            None => MemoryWatermarkStore::new(),
        };
        let target = Arc::new(MemoryTarget::new());
        let store: Arc<dyn TargetStore> = target.clone();

        let summary = SyncOrchestrator::new(&mut source, store, &watermarks, gate)
            .run(&ctx)
            .await?;
        print_summary(&summary);

        println!();
        println!("{}", "Would upsert:".bold());
        for (object, count) in target.counts() {
            println!("  {:<24} {}", object, count.to_string().bright_white());
        }
        return Ok(());
    }

    let token = settings.target_token(env)?;
    let target: Arc<dyn TargetStore> = Arc::new(
        DataverseTarget::new(settings.target.clone(), token).context("Failed to set up the Dynamics target")?,
    );
    let watermarks = SqliteWatermarkStore::open(&watermark_path).await?;

    let summary = SyncOrchestrator::new(&mut source, target, &watermarks, gate)
        .run(&ctx)
        .await?;
    print_summary(&summary);
    Ok(())
}

/// Stored cursor for a dry run, without creating the database
async fn dry_run_cursor(path: &Path, domain: &str) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let store = SqliteWatermarkStore::open(path).await?;
    store.get(domain).await
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "{} Run {} finished in {:.1?}",
        "✓".bright_green().bold(),
        summary.run_id.to_string().dimmed(),
        summary.duration
    );
    println!(
        "  since:    {}",
        summary.since.as_deref().unwrap_or("(full sync)")
    );
    println!(
        "  records:  {} of {} in {} batches ({} pages)",
        summary.records, summary.total_count, summary.batches, summary.pages
    );
    println!(
        "  workers:  peak {}, waited {} times",
        summary.pool.peak_active, summary.pool.waited
    );
    for (object, count) in &summary.upserted {
        println!("  {:<24} {}", object, count.to_string().bright_white());
    }
    if summary.rejected > 0 {
        println!(
            "  {}",
            format!("{} upserts reported failure", summary.rejected).yellow()
        );
    }
    match &summary.watermark {
        Some(cursor) => println!("  watermark -> {}", cursor.bright_cyan()),
        None => println!("  {}", "watermark not advanced".yellow()),
    }
}
