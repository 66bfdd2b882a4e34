//! Paginated source client contract

use async_trait::async_trait;
use serde_json::Value as Json;

/// What to fetch from the source for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    /// Sync domain, e.g. "person"
    pub domain: String,
    /// Only records changed since this cursor (None = full resync)
    pub since: Option<String>,
}

impl SourceQuery {
    pub fn new(domain: impl Into<String>, since: Option<String>) -> Self {
        SourceQuery {
            domain: domain.into(),
            since,
        }
    }
}

/// A source yielding pages of nested JSON records
///
/// `total_count` must stay stable for the lifetime of a run; a change is
/// treated as drift by the orchestrator.
#[async_trait]
pub trait SourceClient: Send {
    /// Begin a new pagination; resets any previous cursor
    async fn start_pagination(&mut self, query: &SourceQuery) -> anyhow::Result<()>;

    /// Fetch the next page; empty means nothing more for this call
    async fn next_page(&mut self) -> anyhow::Result<Vec<Json>>;

    /// Total record count reported by the upstream
    fn total_count(&self) -> usize;

    /// Upstream page size
    fn page_size(&self) -> usize;

    /// Whether another `next_page` call can yield records
    fn has_more_pages(&self) -> bool;
}
