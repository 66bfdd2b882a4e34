//! Paginated JSON HTTP source

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::retry::RetryPolicy;
use crate::pipeline::{SourceClient, SourceQuery};

/// Connection settings for the source API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSourceConfig {
    pub base_url: String,
    /// Response key holding the page's records
    pub items_key: String,
    /// Response key holding the total record count
    pub total_key: String,
    pub page_size: usize,
    /// Environment variable holding the bearer token
    pub token_env: String,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        HttpSourceConfig {
            base_url: String::new(),
            items_key: "items".to_string(),
            total_key: "totalCount".to_string(),
            page_size: 100,
            token_env: "ROSTER_SYNC_SOURCE_TOKEN".to_string(),
            timeout_secs: 60,
            retry: RetryPolicy::default(),
        }
    }
}

/// Source fetching `GET {base}/{domain}?since=..&page=..&pageSize=..`
pub struct HttpSource {
    http: reqwest::Client,
    config: HttpSourceConfig,
    token: Option<String>,
    query: Option<SourceQuery>,
    next_page_number: usize,
    /// First page, fetched by `start_pagination` to learn the total
    prefetched: Option<Vec<Json>>,
    fetched: usize,
    total: usize,
    done: bool,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig, token: Option<String>) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(anyhow!("source base_url is not configured"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpSource {
            http,
            config,
            token,
            query: None,
            next_page_number: 1,
            prefetched: None,
            fetched: 0,
            total: 0,
            done: true,
        })
    }

    fn page_url(&self, domain: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), urlencoding::encode(domain))
    }

    async fn fetch(&mut self) -> Result<Vec<Json>> {
        let query = self
            .query
            .clone()
            .ok_or_else(|| anyhow!("pagination not started"))?;
        let page = self.next_page_number;
        let url = self.page_url(&query.domain);

        let mut params = vec![
            ("page", page.to_string()),
            ("pageSize", self.config.page_size.to_string()),
        ];
        if let Some(since) = &query.since {
            params.push(("since", since.clone()));
        }

        let body: Json = self
            .config
            .retry
            .execute(&format!("GET {} page {}", url, page), || {
                let mut request = self.http.get(&url).query(&params);
                if let Some(token) = &self.token {
                    request = request.bearer_auth(token);
                }
                async move { request.send().await?.error_for_status()?.json::<Json>().await }
            })
            .await
            .with_context(|| format!("Failed to fetch page {} of '{}'", page, query.domain))?;

        let (records, total) = parse_page(&body, &self.config.items_key, &self.config.total_key)?;

        self.record_page(records.len(), total);

        log::debug!(
            "Source page {}: {} records ({} of {} fetched)",
            page,
            records.len(),
            self.fetched,
            self.total
        );
        Ok(records)
    }
}

impl HttpSource {
    /// Advance paging state. Servers may cap pages below `page_size`, so only
    /// the reported total or an empty page ends pagination.
    fn record_page(&mut self, count: usize, total: usize) {
        self.next_page_number += 1;
        self.fetched += count;
        self.total = total;
        if count == 0 || self.fetched >= self.total {
            self.done = true;
        }
    }
}

/// Split a page body into its records and the reported total
fn parse_page(body: &Json, items_key: &str, total_key: &str) -> Result<(Vec<Json>, usize)> {
    let records = body
        .get(items_key)
        .and_then(Json::as_array)
        .cloned()
        .ok_or_else(|| anyhow!("response has no '{}' array", items_key))?;
    let total = body
        .get(total_key)
        .and_then(Json::as_u64)
        .ok_or_else(|| anyhow!("response has no numeric '{}'", total_key))? as usize;
    Ok((records, total))
}

#[async_trait]
impl SourceClient for HttpSource {
    async fn start_pagination(&mut self, query: &SourceQuery) -> Result<()> {
        self.query = Some(query.clone());
        self.next_page_number = 1;
        self.fetched = 0;
        self.done = false;
        let first = self.fetch().await?;
        self.prefetched = Some(first);
        Ok(())
    }

    async fn next_page(&mut self) -> Result<Vec<Json>> {
        if let Some(page) = self.prefetched.take() {
            return Ok(page);
        }
        if self.done {
            return Ok(Vec::new());
        }
        self.fetch().await
    }

    fn total_count(&self) -> usize {
        self.total
    }

    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn has_more_pages(&self) -> bool {
        self.prefetched.is_some() || !self.done
    }
}
