//! Pagination buffer: arbitrary upstream pages in, exact-size batches out

use serde_json::Value as Json;

use super::source::SourceClient;
use crate::error::{Result, SyncError};

/// Re-slices source pages into batches of exactly `batch_size` records
///
/// Every batch except possibly the last has exactly `batch_size` records,
/// and the concatenation of all batches equals the concatenation of all
/// pages (cut off at the record limit, if any).
pub struct PaginationBuffer<'s> {
    source: &'s mut dyn SourceClient,
    batch_size: usize,
    limit: Option<usize>,
    backlog: Vec<Json>,
    emitted: usize,
    pages_fetched: usize,
}

impl<'s> PaginationBuffer<'s> {
    /// Wrap a source on which pagination has already started
    pub fn new(source: &'s mut dyn SourceClient, batch_size: usize, limit: Option<usize>) -> Self {
        PaginationBuffer {
            source,
            batch_size: batch_size.max(1),
            limit,
            backlog: Vec::new(),
            emitted: 0,
            pages_fetched: 0,
        }
    }

    /// Next batch, or an empty vector while still accumulating
    ///
    /// Fetches at most one upstream page per call, and none while the backlog
    /// already holds a full batch. Check `is_exhausted` to tell an
    /// intermediate empty result from the end of the stream.
    pub async fn next_batch(&mut self) -> Result<Vec<Json>> {
        let remaining = self.remaining_allowance();
        if remaining == 0 {
            return Ok(Vec::new());
        }

        if self.backlog.len() < self.batch_size && self.source.has_more_pages() {
            let page = self.source.next_page().await.map_err(SyncError::source)?;
            self.pages_fetched += 1;
            log::debug!(
                "Fetched page {} ({} records, backlog now {})",
                self.pages_fetched,
                page.len(),
                self.backlog.len() + page.len()
            );
            self.backlog.extend(page);
        }

        let take = if self.backlog.len() >= self.batch_size {
            self.batch_size
        } else if !self.source.has_more_pages() {
            self.backlog.len()
        } else {
            0
        };
        let take = take.min(remaining);

        self.emitted += take;
        Ok(self.backlog.drain(..take).collect())
    }

    /// No further batch will be produced
    pub fn is_exhausted(&self) -> bool {
        self.remaining_allowance() == 0 || (self.backlog.is_empty() && !self.source.has_more_pages())
    }

    /// Upstream pages fetched so far
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Records emitted so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Records held back for the next batch
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Current upstream total count
    pub fn total_count(&self) -> usize {
        self.source.total_count()
    }

    /// Upstream page size
    pub fn page_size(&self) -> usize {
        self.source.page_size()
    }

    fn remaining_allowance(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.emitted),
            None => usize::MAX,
        }
    }
}
