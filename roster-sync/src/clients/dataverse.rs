//! Dynamics 365 / Dataverse Web API target store

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};

use super::entity_set::EntityNames;
use super::retry::{RetryPolicy, Retryable};
use crate::pipeline::TargetStore;
use crate::transform::OutputRecord;

/// Connection settings for the Dataverse target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataverseConfig {
    /// Organization URL, e.g. https://contoso.crm4.dynamics.com
    pub url: String,
    pub api_version: String,
    /// Environment variable holding the bearer token
    pub token_env: String,
    /// Records per UpsertMultiple request
    pub upsert_chunk: usize,
    /// Values per `In` lookup filter
    pub lookup_chunk: usize,
    /// Lookup requests in flight at once
    pub lookup_concurrency: usize,
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub names: EntityNames,
    pub retry: RetryPolicy,
}

impl Default for DataverseConfig {
    fn default() -> Self {
        DataverseConfig {
            url: String::new(),
            api_version: "v9.2".to_string(),
            token_env: "ROSTER_SYNC_TARGET_TOKEN".to_string(),
            upsert_chunk: 500,
            lookup_chunk: 100,
            lookup_concurrency: 4,
            timeout_secs: 120,
            names: EntityNames::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Failure of one Web API call
#[derive(Debug)]
enum CallError {
    Http(reqwest::Error),
    Status { status: reqwest::StatusCode, body: String },
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Http(e) => write!(f, "{}", e),
            CallError::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
        }
    }
}

impl std::error::Error for CallError {}

impl Retryable for CallError {
    fn is_retryable(&self) -> bool {
        match self {
            CallError::Http(e) => e.is_retryable(),
            CallError::Status { status, .. } => super::retry::is_retryable_status(*status),
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        CallError::Http(e)
    }
}

/// Target store backed by the Dataverse Web API
pub struct DataverseTarget {
    http: reqwest::Client,
    config: DataverseConfig,
    token: String,
}

impl DataverseTarget {
    pub fn new(config: DataverseConfig, token: String) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(anyhow!("target url is not configured"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(DataverseTarget {
            http,
            config,
            token,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/data/{}/{}",
            self.config.url.trim_end_matches('/'),
            self.config.api_version,
            path
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .header("Accept", "application/json")
    }

    async fn send(request: reqwest::RequestBuilder) -> std::result::Result<Json, CallError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Status { status, body });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Json::Null);
        }
        Ok(response.json::<Json>().await?)
    }

    /// Fetch native ids for one chunk of source id values, following paging links
    async fn lookup_chunk(
        &self,
        entity_set: &str,
        id_field: &str,
        native_field: &str,
        values: &[String],
    ) -> Result<HashMap<String, String>> {
        let mut found = HashMap::new();
        let mut next = Some(self.api_url(entity_set));
        let mut first = true;

        while let Some(url) = next.take() {
            let params: Vec<(&str, String)> = if first {
                vec![
                    ("$select", format!("{},{}", native_field, id_field)),
                    ("$filter", in_filter(id_field, values)),
                ]
            } else {
                Vec::new()
            };
            first = false;

            let body = self
                .config
                .retry
                .execute(&format!("lookup {}", entity_set), || {
                    Self::send(self.request(reqwest::Method::GET, &url).query(&params))
                })
                .await
                .with_context(|| format!("Failed to look up {} ids in '{}'", values.len(), entity_set))?;

            if let Some(rows) = body.get("value").and_then(Json::as_array) {
                for row in rows {
                    let source = row.get(id_field).and_then(json_key);
                    let native = row.get(native_field).and_then(json_key);
                    if let (Some(source), Some(native)) = (source, native) {
                        found.insert(source, native);
                    }
                }
            }
            next = body
                .get("@odata.nextLink")
                .and_then(Json::as_str)
                .map(String::from);
        }

        Ok(found)
    }
}

/// `Microsoft.Dynamics.CRM.In` filter over string values
fn in_filter(field: &str, values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("'{}'", v.replace('\'', "''")))
        .collect();
    format!(
        "Microsoft.Dynamics.CRM.In(PropertyName='{}',PropertyValues=[{}])",
        field,
        quoted.join(",")
    )
}

fn json_key(value: &Json) -> Option<String> {
    match value {
        Json::String(s) if !s.is_empty() => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// UpsertMultiple payload for one chunk
fn upsert_body(logical_name: &str, records: &[OutputRecord]) -> Json {
    let targets: Vec<Json> = records
        .iter()
        .map(|record| {
            let mut target = serde_json::Map::new();
            target.insert(
                "@odata.type".to_string(),
                json!(format!("Microsoft.Dynamics.CRM.{}", logical_name)),
            );
            for (field, value) in record {
                target.insert(field.clone(), value.to_json());
            }
            Json::Object(target)
        })
        .collect();
    json!({ "Targets": targets })
}

#[async_trait]
impl TargetStore for DataverseTarget {
    async fn bulk_upsert(&self, object: &str, records: &[OutputRecord], id_field: &str) -> Result<bool> {
        let entity_set = self.config.names.entity_set(object);
        let logical = self.config.names.logical_name(object);
        let url = self.api_url(&format!("{}/Microsoft.Dynamics.CRM.UpsertMultiple", entity_set));
        let mut ok = true;

        for chunk in records.chunks(self.config.upsert_chunk.max(1)) {
            let body = upsert_body(&logical, chunk);
            let result = self
                .config
                .retry
                .execute(&format!("UpsertMultiple {}", entity_set), || {
                    Self::send(self.request(reqwest::Method::POST, &url).json(&body))
                })
                .await;

            match result {
                Ok(_) => log::debug!(
                    "Upserted {} '{}' records keyed by {}",
                    chunk.len(),
                    entity_set,
                    id_field
                ),
                Err(CallError::Status { status, body }) if status.is_client_error() => {
                    log::warn!(
                        "UpsertMultiple on '{}' rejected {} records: HTTP {}: {}",
                        entity_set,
                        chunk.len(),
                        status,
                        body
                    );
                    ok = false;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("UpsertMultiple on '{}' failed", entity_set)));
                }
            }
        }

        Ok(ok)
    }

    async fn bulk_lookup_ids(
        &self,
        object: &str,
        id_field: &str,
        native_field: &str,
        values: &[String],
    ) -> Result<HashMap<String, String>> {
        let entity_set = self.config.names.entity_set(object);

        let lookups: Vec<_> = values
            .chunks(self.config.lookup_chunk.max(1))
            .map(|chunk| self.lookup_chunk(&entity_set, id_field, native_field, chunk))
            .collect();
        let maps: Vec<HashMap<String, String>> = stream::iter(lookups)
            .buffer_unordered(self.config.lookup_concurrency.max(1))
            .try_collect()
            .await?;

        let found: HashMap<String, String> = maps.into_iter().flatten().collect();
        log::debug!(
            "Lookup on '{}': {} of {} ids known",
            entity_set,
            found.len(),
            values.len()
        );
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Value;

    #[test]
    fn test_in_filter_quotes_values() {
        let filter = in_filter("hr_personid", &["P-1".into(), "O'Brien".into()]);
        assert_eq!(
            filter,
            "Microsoft.Dynamics.CRM.In(PropertyName='hr_personid',PropertyValues=['P-1','O''Brien'])"
        );
    }

    #[test]
    fn test_upsert_body() {
        let mut record = OutputRecord::new();
        record.insert("hr_personid".into(), Value::from("P-1"));
        record.insert("hr_active".into(), Value::from("Y"));

        let body = upsert_body("contact", &[record]);
        assert_eq!(
            body,
            json!({ "Targets": [{
                "@odata.type": "Microsoft.Dynamics.CRM.contact",
                "hr_personid": "P-1",
                "hr_active": "Y"
            }] })
        );
    }

    #[test]
    fn test_api_url() {
        let config = DataverseConfig {
            url: "https://contoso.crm4.dynamics.com/".into(),
            ..DataverseConfig::default()
        };
        let target = DataverseTarget::new(config, "token".into()).unwrap();
        assert_eq!(
            target.api_url("contacts"),
            "https://contoso.crm4.dynamics.com/api/data/v9.2/contacts"
        );
        assert!(DataverseTarget::new(DataverseConfig::default(), String::new()).is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config: DataverseConfig = toml::from_str(
            r#"
            url = "https://contoso.crm4.dynamics.com"
            simple_plurals = true
            [overrides]
            Name = "hr_personnames"
            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.names.entity_set("Name"), "hr_personnames");
        assert!(config.names.simple_plurals);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.api_version, "v9.2");
    }

    #[test]
    fn test_json_key() {
        assert_eq!(json_key(&json!("abc")), Some("abc".to_string()));
        assert_eq!(json_key(&json!(12)), Some("12".to_string()));
        assert_eq!(json_key(&json!("")), None);
        assert_eq!(json_key(&json!(null)), None);
    }
}
