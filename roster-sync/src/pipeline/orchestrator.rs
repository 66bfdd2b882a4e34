//! Sync orchestrator: pagination, dispatch, drift/anomaly/pressure checks, drain

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::buffer::PaginationBuffer;
use super::pressure::{BackpressureConfig, PressureGate, duration_secs};
use super::source::{SourceClient, SourceQuery};
use super::target::TargetStore;
use super::watermark::WatermarkStore;
use super::worker::{BatchJob, PoolStats, WorkerPool, WorkerReport};
use crate::error::{Result, SyncError};
use crate::mapping::{MappingConfig, ObjectFilter};

/// Tunables for a sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Records per batch
    pub batch_size: usize,
    /// Concurrent batch workers
    pub max_workers: usize,
    /// Stop after this many records
    pub record_limit: Option<usize>,
    /// Wait between checks while the pool is saturated
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Longest wait for in-flight workers once dispatch has stopped
    #[serde(with = "duration_secs")]
    pub max_drain: Duration,
    /// Ceiling for the whole run
    #[serde(with = "duration_secs")]
    pub max_run: Duration,
    /// Allowed factor over the estimated batch and page counts
    pub anomaly_margin: f64,
    pub backpressure: BackpressureConfig,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            batch_size: 200,
            max_workers: 3,
            record_limit: None,
            poll_interval: Duration::from_secs(1),
            max_drain: Duration::from_secs(600),
            max_run: Duration::from_secs(4 * 3600),
            anomaly_margin: 1.5,
            backpressure: BackpressureConfig::default(),
        }
    }
}

/// Everything one run needs, passed explicitly to each component
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub mapping: Arc<MappingConfig>,
    pub filter: Arc<ObjectFilter>,
    pub settings: SyncSettings,
    /// Ignore the stored watermark
    pub full_resync: bool,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(mapping: MappingConfig, filter: ObjectFilter, settings: SyncSettings) -> Result<Self> {
        mapping.check_filter(&filter)?;
        if settings.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".into()));
        }
        Ok(RunContext {
            run_id: Uuid::new_v4(),
            mapping: Arc::new(mapping),
            filter: Arc::new(filter),
            settings,
            full_resync: false,
            started_at: Utc::now(),
        })
    }

    pub fn with_full_resync(mut self, full: bool) -> Self {
        self.full_resync = full;
        self
    }
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub domain: String,
    /// Watermark the run started from
    pub since: Option<String>,
    pub total_count: usize,
    pub pages: usize,
    pub batches: usize,
    pub records: usize,
    /// Records upserted per object
    pub upserted: BTreeMap<String, usize>,
    /// Upserts the target reported as failed
    pub rejected: usize,
    pub pool: PoolStats,
    pub duration: Duration,
    /// New watermark, if it was advanced
    pub watermark: Option<String>,
}

/// Drives one sync run end to end
pub struct SyncOrchestrator<'a> {
    source: &'a mut dyn SourceClient,
    target: Arc<dyn TargetStore>,
    watermarks: &'a dyn WatermarkStore,
    gate: PressureGate,
}

/// Upper bounds derived from the reported total
struct Limits {
    batches: usize,
    pages: usize,
}

impl Limits {
    fn estimate(expected: usize, batch_size: usize, total: usize, page_size: usize, margin: f64) -> Self {
        let allowed = |count: usize| (count as f64 * margin).ceil() as usize + 1;
        Limits {
            batches: allowed(expected.div_ceil(batch_size.max(1))),
            pages: allowed(total.div_ceil(page_size.max(1))),
        }
    }
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(
        source: &'a mut dyn SourceClient,
        target: Arc<dyn TargetStore>,
        watermarks: &'a dyn WatermarkStore,
        gate: PressureGate,
    ) -> Self {
        SyncOrchestrator {
            source,
            target,
            watermarks,
            gate,
        }
    }

    /// Run to completion; the watermark advances only on success
    pub async fn run(self, ctx: &RunContext) -> Result<RunSummary> {
        let started = Instant::now();
        let domain = ctx.mapping.domain.clone();
        let settings = &ctx.settings;

        let since = if ctx.full_resync {
            None
        } else {
            self.watermarks
                .get(&domain)
                .await
                .map_err(SyncError::watermark)?
        };

        log::info!(
            "Run {} for '{}' starting (since {})",
            ctx.run_id,
            domain,
            since.as_deref().unwrap_or("the beginning")
        );

        self.source
            .start_pagination(&SourceQuery::new(&domain, since.clone()))
            .await
            .map_err(SyncError::source)?;

        let mut summary = RunSummary {
            run_id: ctx.run_id,
            domain: domain.clone(),
            since,
            total_count: self.source.total_count(),
            pages: 0,
            batches: 0,
            records: 0,
            upserted: BTreeMap::new(),
            rejected: 0,
            pool: PoolStats::default(),
            duration: Duration::ZERO,
            watermark: None,
        };

        let mut pool = WorkerPool::new(
            Arc::clone(&ctx.mapping),
            Arc::clone(&ctx.filter),
            Arc::clone(&self.target),
            settings.max_workers,
        );
        let mut buffer = PaginationBuffer::new(self.source, settings.batch_size, settings.record_limit);

        let initial_total = summary.total_count;
        let expected = settings
            .record_limit
            .map_or(initial_total, |limit| limit.min(initial_total));
        let limits = Limits::estimate(
            expected,
            settings.batch_size,
            initial_total,
            buffer.page_size(),
            settings.anomaly_margin,
        );
        let deadline = started + settings.max_run;

        log::info!(
            "Source reports {} records; expecting at most {} batches / {} pages",
            initial_total,
            limits.batches,
            limits.pages
        );

        let gate = &self.gate;
        let mut failure: Option<SyncError> = None;

        let dispatch_result: Result<()> = async {
            loop {
                if Instant::now() >= deadline {
                    return Err(SyncError::RunTimeout { limit: settings.max_run });
                }
                while let Some(report) = pool.try_next_report() {
                    absorb(&mut summary, report)?;
                }
                if buffer.is_exhausted() {
                    if buffer.emitted() != expected {
                        return Err(SyncError::RecordCountMismatch {
                            expected,
                            received: buffer.emitted(),
                        });
                    }
                    return Ok(());
                }

                let pages_before = buffer.pages_fetched();
                let records = buffer.next_batch().await?;
                if buffer.pages_fetched() != pages_before {
                    let current = buffer.total_count();
                    if current != initial_total {
                        return Err(SyncError::SourceDrift {
                            initial: initial_total,
                            current,
                        });
                    }
                    if buffer.pages_fetched() > limits.pages {
                        return Err(SyncError::BatchCountAnomaly {
                            observed: buffer.pages_fetched(),
                            allowed: limits.pages,
                            unit: "pages",
                        });
                    }
                }
                if records.is_empty() {
                    continue;
                }

                summary.batches += 1;
                if summary.batches > limits.batches {
                    return Err(SyncError::BatchCountAnomaly {
                        observed: summary.batches,
                        allowed: limits.batches,
                        unit: "batches",
                    });
                }

                gate.check().await?;

                if !pool.has_capacity() {
                    pool.record_wait();
                }
                while !pool.has_capacity() {
                    if let Some(report) = pool.next_report(settings.poll_interval).await {
                        absorb(&mut summary, report)?;
                    }
                    if Instant::now() >= deadline {
                        return Err(SyncError::RunTimeout { limit: settings.max_run });
                    }
                }

                summary.records += records.len();
                pool.dispatch(BatchJob {
                    index: summary.batches,
                    records,
                });
            }
        }
        .await;

        if let Err(e) = dispatch_result {
            log::error!("Run {} stopping dispatch: {}", ctx.run_id, e);
            failure = Some(e);
        }
        summary.pages = buffer.pages_fetched();
        let truncated = settings
            .record_limit
            .is_some_and(|limit| buffer.emitted() >= limit && buffer.emitted() < initial_total);

        // Drain: in-flight workers finish, nothing new is dispatched
        let drain_started = Instant::now();
        while pool.active() > 0 {
            let waited = drain_started.elapsed();
            if waited >= settings.max_drain {
                let timeout = SyncError::DrainTimeout {
                    active: pool.active(),
                    waited,
                };
                log::error!("Run {}: {}", ctx.run_id, timeout);
                failure.get_or_insert(timeout);
                break;
            }
            let wait = settings.poll_interval.min(settings.max_drain - waited);
            if let Some(report) = pool.next_report(wait).await {
                if let Err(e) = absorb(&mut summary, report) {
                    log::error!("Run {}: {}", ctx.run_id, e);
                    failure.get_or_insert(e);
                }
            }
        }

        summary.pool = pool.stats();
        summary.duration = started.elapsed();

        if let Some(e) = failure {
            log::error!("Run {} failed, watermark for '{}' not advanced", ctx.run_id, domain);
            return Err(e);
        }

        if !truncated {
            let cursor = ctx.started_at.to_rfc3339();
            self.watermarks
                .set(&domain, &cursor)
                .await
                .map_err(SyncError::watermark)?;
            summary.watermark = Some(cursor);
        } else {
            log::warn!(
                "Record limit stopped the run after {} of {} records, watermark for '{}' not advanced",
                summary.records,
                initial_total,
                domain
            );
        }

        log::info!(
            "Run {} finished: {} records in {} batches ({} pages) in {:.1?}",
            ctx.run_id,
            summary.records,
            summary.batches,
            summary.pages,
            summary.duration
        );

        Ok(summary)
    }
}

/// Fold a worker report into the summary; worker errors become fatal
fn absorb(summary: &mut RunSummary, report: WorkerReport) -> Result<()> {
    match report.result {
        Ok(outcome) => {
            log::info!(
                "Batch {} done: {} records, upserted {:?}",
                report.batch,
                outcome.records,
                outcome.upserted
            );
            for (object, count) in outcome.upserted {
                *summary.upserted.entry(object).or_default() += count;
            }
            summary.rejected += outcome.rejected.len();
            Ok(())
        }
        Err(e) => Err(SyncError::WorkerFailure {
            batch: report.batch,
            source: Box::new(e),
        }),
    }
}
