//! Bounded pool of batch workers reporting through a completion channel

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::mpsc;

use super::target::TargetStore;
use crate::error::{Result, SyncError};
use crate::mapping::{MappingConfig, ObjectFilter};
use crate::transform::{IdentityResolver, RecordTransformer};

/// One batch handed to a worker
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// 1-based dispatch sequence number
    pub index: usize,
    pub records: Vec<Json>,
}

/// What a successful worker did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub records: usize,
    /// Records upserted per object
    pub upserted: BTreeMap<String, usize>,
    /// Objects whose upsert reported failure
    pub rejected: Vec<String>,
}

/// Completion message from a worker
#[derive(Debug)]
pub struct WorkerReport {
    pub batch: usize,
    pub result: Result<BatchOutcome>,
}

/// Counters for the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    /// Times a dispatch had to wait for a free slot
    pub waited: usize,
    /// Highest number of workers active at once
    pub peak_active: usize,
}

/// Runs transform + upsert per batch on at most `max_workers` tasks
///
/// Only the owner mutates the active count; workers report through the
/// channel and never touch shared pool state.
pub struct WorkerPool {
    mapping: Arc<MappingConfig>,
    filter: Arc<ObjectFilter>,
    target: Arc<dyn TargetStore>,
    max_workers: usize,
    active: usize,
    stats: PoolStats,
    tx: mpsc::UnboundedSender<WorkerReport>,
    rx: mpsc::UnboundedReceiver<WorkerReport>,
}

impl WorkerPool {
    pub fn new(
        mapping: Arc<MappingConfig>,
        filter: Arc<ObjectFilter>,
        target: Arc<dyn TargetStore>,
        max_workers: usize,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        WorkerPool {
            mapping,
            filter,
            target,
            max_workers: max_workers.max(1),
            active: 0,
            stats: PoolStats::default(),
            tx,
            rx,
        }
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn has_capacity(&self) -> bool {
        self.active < self.max_workers
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Note that a dispatch is blocked on a full pool
    pub fn record_wait(&mut self) {
        self.stats.waited += 1;
    }

    /// Spawn a worker for the batch; the caller checks capacity first
    pub fn dispatch(&mut self, job: BatchJob) {
        let batch = job.index;
        let mapping = Arc::clone(&self.mapping);
        let filter = Arc::clone(&self.filter);
        let target = Arc::clone(&self.target);
        let tx = self.tx.clone();

        self.active += 1;
        self.stats.dispatched += 1;
        self.stats.peak_active = self.stats.peak_active.max(self.active);
        log::info!(
            "Dispatching batch {} ({} records, {}/{} workers active)",
            batch,
            job.records.len(),
            self.active,
            self.max_workers
        );

        tokio::spawn(async move {
            // Inner task so a panic still produces a report
            let handle = tokio::spawn(async move {
                process_batch(&mapping, &filter, target.as_ref(), &job).await
            });
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(SyncError::WorkerPanicked(e.to_string())),
            };
            // Receiver gone means the run was abandoned
            let _ = tx.send(WorkerReport { batch, result });
        });
    }

    /// Wait up to `timeout` for the next completion
    pub async fn next_report(&mut self, timeout: Duration) -> Option<WorkerReport> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(report)) => Some(self.complete(report)),
            _ => None,
        }
    }

    /// A completion that is already waiting, if any
    pub fn try_next_report(&mut self) -> Option<WorkerReport> {
        let report = self.rx.try_recv().ok()?;
        Some(self.complete(report))
    }

    fn complete(&mut self, report: WorkerReport) -> WorkerReport {
        self.active = self.active.saturating_sub(1);
        match &report.result {
            Ok(_) => self.stats.completed += 1,
            Err(_) => self.stats.failed += 1,
        }
        report
    }
}

/// Identity lookup, transform, then one upsert per object in dependency order
pub async fn process_batch(
    mapping: &MappingConfig,
    filter: &ObjectFilter,
    target: &dyn TargetStore,
    job: &BatchJob,
) -> Result<BatchOutcome> {
    let ids = IdentityResolver::build(mapping, filter, &job.records, target).await?;
    let output = RecordTransformer::new(mapping, &ids).transform(&job.records, filter)?;

    let mut outcome = BatchOutcome {
        records: job.records.len(),
        ..BatchOutcome::default()
    };

    for object in mapping.objects() {
        let Some(records) = output.get(&object.name).filter(|r| !r.is_empty()) else {
            continue;
        };

        let ok = target
            .bulk_upsert(&object.name, records, object.target_id_field())
            .await
            .map_err(SyncError::target)?;

        if ok {
            log::debug!("Batch {}: upserted {} '{}' records", job.index, records.len(), object.name);
            outcome.upserted.insert(object.name.clone(), records.len());
        } else {
            log::warn!(
                "Batch {}: upsert of {} '{}' records reported failure",
                job.index,
                records.len(),
                object.name
            );
            outcome.rejected.push(object.name.clone());
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::ObjectConfig;
    use crate::pipeline::MemoryTarget;
    use serde_json::json;

    fn mapping() -> Arc<MappingConfig> {
        Arc::new(
            MappingConfig::new(
                "person",
                vec![
                    ObjectConfig::flat("Contact", "personId", "HR_Id"),
                    ObjectConfig::branched("Name", "names.nameId", "HR_Name_Id"),
                ],
            )
            .unwrap(),
        )
    }

    fn job(index: usize, ids: &[&str]) -> BatchJob {
        BatchJob {
            index,
            records: ids
                .iter()
                .map(|id| json!({ "personId": id, "names": [{ "nameId": format!("{}-N", id) }] }))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_process_batch_upserts_each_object_once() {
        let target = MemoryTarget::new();
        let outcome = process_batch(&mapping(), &ObjectFilter::all(), &target, &job(1, &["A", "B"]))
            .await
            .unwrap();

        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.upserted["Contact"], 2);
        assert_eq!(outcome.upserted["Name"], 2);
        assert_eq!(target.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_upsert_is_not_fatal() {
        let target = MemoryTarget::new().rejecting("Name");
        let outcome = process_batch(&mapping(), &ObjectFilter::all(), &target, &job(1, &["A"]))
            .await
            .unwrap();
        assert_eq!(outcome.rejected, vec!["Name".to_string()]);
        assert_eq!(outcome.upserted.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_reports_completion_and_failure() {
        let target: Arc<dyn TargetStore> = Arc::new(MemoryTarget::new().failing("Name"));
        let mut pool = WorkerPool::new(mapping(), Arc::new(ObjectFilter::all()), target, 2);

        pool.dispatch(job(1, &["A"]));
        assert_eq!(pool.active(), 1);
        assert!(pool.has_capacity());

        let report = pool.next_report(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.batch, 1);
        assert!(matches!(report.result, Err(SyncError::Target(_))));
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.stats().failed, 1);
        assert!(pool.try_next_report().is_none());
    }
}
