//! In-memory collaborators for dry runs, previews and tests

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value as Json;

use super::source::{SourceClient, SourceQuery};
use super::target::TargetStore;
use super::watermark::WatermarkStore;
use crate::transform::OutputRecord;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A source replaying scripted pages
#[derive(Debug, Default)]
pub struct MemorySource {
    pages: Vec<Vec<Json>>,
    cursor: usize,
    total: usize,
    page_size: usize,
    /// (pages served, new total): simulate upstream drift
    drift: Option<(usize, usize)>,
    queries: Vec<SourceQuery>,
}

impl MemorySource {
    /// Scripted pages; the reported total is the sum of their sizes
    pub fn new(pages: Vec<Vec<Json>>) -> Self {
        let total = pages.iter().map(Vec::len).sum();
        let page_size = pages.iter().map(Vec::len).max().unwrap_or_default();
        MemorySource {
            pages,
            total,
            page_size,
            ..Self::default()
        }
    }

    /// Split records into pages of the given sizes
    pub fn from_records(records: Vec<Json>, page_sizes: &[usize]) -> Self {
        let mut remaining = records.into_iter();
        let pages = page_sizes
            .iter()
            .map(|size| remaining.by_ref().take(*size).collect())
            .collect();
        Self::new(pages)
    }

    /// Override the reported total
    pub fn with_total(mut self, total: usize) -> Self {
        self.total = total;
        self
    }

    /// Report `new_total` once `after_pages` pages have been served
    pub fn with_drift(mut self, after_pages: usize, new_total: usize) -> Self {
        self.drift = Some((after_pages, new_total));
        self
    }

    /// Queries passed to `start_pagination`, in order
    pub fn queries(&self) -> &[SourceQuery] {
        &self.queries
    }
}

#[async_trait]
impl SourceClient for MemorySource {
    async fn start_pagination(&mut self, query: &SourceQuery) -> Result<()> {
        self.cursor = 0;
        self.queries.push(query.clone());
        Ok(())
    }

    async fn next_page(&mut self) -> Result<Vec<Json>> {
        let page = self.pages.get(self.cursor).cloned().unwrap_or_default();
        if self.cursor < self.pages.len() {
            self.cursor += 1;
        }
        if let Some((after, new_total)) = self.drift {
            if self.cursor >= after {
                self.total = new_total;
            }
        }
        Ok(page)
    }

    fn total_count(&self) -> usize {
        self.total
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn has_more_pages(&self) -> bool {
        self.cursor < self.pages.len()
    }
}

/// A target store recording every upsert
///
/// Upserted records get a generated native id so later lookups find them.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    upserts: Mutex<BTreeMap<String, Vec<OutputRecord>>>,
    index: Mutex<HashMap<String, HashMap<String, String>>>,
    rejecting: BTreeSet<String>,
    failing: BTreeSet<String>,
    /// (object, source id): upserts containing that record fail immediately
    failing_keys: BTreeSet<(String, String)>,
    delay: Option<Duration>,
    upsert_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts of this object report `false`
    pub fn rejecting(mut self, object: impl Into<String>) -> Self {
        self.rejecting.insert(object.into());
        self
    }

    /// Upserts of this object return an error
    pub fn failing(mut self, object: impl Into<String>) -> Self {
        self.failing.insert(object.into());
        self
    }

    /// Upserts of this object that contain the given source id fail before any delay
    pub fn failing_on(mut self, object: impl Into<String>, key: impl Into<String>) -> Self {
        self.failing_keys.insert((object.into(), key.into()));
        self
    }

    /// Sleep inside every upsert
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Register an existing target record
    pub fn seed_id(&self, object: &str, source_id: &str, native_id: &str) {
        lock(&self.index)
            .entry(object.to_string())
            .or_default()
            .insert(source_id.to_string(), native_id.to_string());
    }

    /// All records upserted so far for an object
    pub fn records(&self, object: &str) -> Vec<OutputRecord> {
        lock(&self.upserts).get(object).cloned().unwrap_or_default()
    }

    /// Upserted record count per object
    pub fn counts(&self) -> BTreeMap<String, usize> {
        lock(&self.upserts)
            .iter()
            .map(|(object, records)| (object.clone(), records.len()))
            .collect()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    /// Highest number of upserts observed running at once
    pub fn max_concurrent_upserts(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn bulk_upsert(&self, object: &str, records: &[OutputRecord], id_field: &str) -> Result<bool> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let poisoned = records.iter().find_map(|record| {
            record
                .get(id_field)
                .and_then(|v| v.as_key())
                .filter(|key| self.failing_keys.contains(&(object.to_string(), key.clone())))
        });
        if let Some(key) = poisoned {
            bail!("upsert of '{}' record {} rejected by target", object, key);
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(object) {
            bail!("upsert of {} '{}' records rejected by target", records.len(), object);
        }
        if self.rejecting.contains(object) {
            return Ok(false);
        }

        {
            let mut index = lock(&self.index);
            let ids = index.entry(object.to_string()).or_default();
            for record in records {
                if let Some(key) = record.get(id_field).and_then(|v| v.as_key()) {
                    ids.entry(key)
                        .or_insert_with(|| uuid::Uuid::new_v4().to_string());
                }
            }
        }

        lock(&self.upserts)
            .entry(object.to_string())
            .or_default()
            .extend(records.iter().cloned());
        Ok(true)
    }

    async fn bulk_lookup_ids(
        &self,
        object: &str,
        _id_field: &str,
        _native_field: &str,
        values: &[String],
    ) -> Result<HashMap<String, String>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        let index = lock(&self.index);
        let Some(ids) = index.get(object) else {
            return Ok(HashMap::new());
        };
        Ok(values
            .iter()
            .filter_map(|v| ids.get(v).map(|native| (v.clone(), native.clone())))
            .collect())
    }
}

/// Watermarks held in memory
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    cursors: Mutex<HashMap<String, String>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(domain: &str, cursor: &str) -> Self {
        let store = Self::new();
        lock(&store.cursors).insert(domain.to_string(), cursor.to_string());
        store
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, domain: &str) -> Result<Option<String>> {
        Ok(lock(&self.cursors).get(domain).cloned())
    }

    async fn set(&self, domain: &str, cursor: &str) -> Result<()> {
        lock(&self.cursors).insert(domain.to_string(), cursor.to_string());
        Ok(())
    }
}
