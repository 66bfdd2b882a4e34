//! Watermark persistence: the last successfully synchronized cursor per domain

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

/// Read and advance per-domain sync cursors
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, domain: &str) -> Result<Option<String>>;

    async fn set(&self, domain: &str, cursor: &str) -> Result<()>;
}

/// Watermarks in a local SQLite database
#[derive(Debug, Clone)]
pub struct SqliteWatermarkStore {
    pool: SqlitePool,
}

impl SqliteWatermarkStore {
    /// Open (creating if needed) the database file at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create watermark directory {}", parent.display())
            })?;
        }
        Self::connect(&format!("sqlite://{}", path.display())).await
    }

    /// Connect to a SQLite URL, e.g. `sqlite::memory:`
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid watermark database URL '{}'", url))?
            .create_if_missing(true);

        // One connection: an in-memory database is per connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open watermark database")?;

        let store = SqliteWatermarkStore { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watermarks (
                domain TEXT PRIMARY KEY NOT NULL,
                cursor TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create watermarks table")?;
        Ok(())
    }

    /// All stored watermarks as (domain, cursor, updated_at)
    pub async fn list(&self) -> Result<Vec<(String, String, String)>> {
        let rows = sqlx::query("SELECT domain, cursor, updated_at FROM watermarks ORDER BY domain")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list watermarks")?;

        let mut watermarks = Vec::with_capacity(rows.len());
        for row in rows {
            watermarks.push((
                row.try_get("domain")?,
                row.try_get("cursor")?,
                row.try_get("updated_at")?,
            ));
        }
        Ok(watermarks)
    }
}

#[async_trait]
impl WatermarkStore for SqliteWatermarkStore {
    async fn get(&self, domain: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT cursor FROM watermarks WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read watermark for '{}'", domain))?;

        match row {
            Some(row) => Ok(Some(row.try_get("cursor")?)),
            None => Ok(None),
        }
    }

    async fn set(&self, domain: &str, cursor: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO watermarks (domain, cursor, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
            "#,
        )
        .bind(domain)
        .bind(cursor)
        .bind(&now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to store watermark for '{}'", domain))?;

        log::debug!("Watermark for '{}' set to {}", domain, cursor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_get_set() {
        let store = SqliteWatermarkStore::connect("sqlite::memory:").await.unwrap();

        assert_eq!(store.get("person").await.unwrap(), None);

        store.set("person", "2024-01-01T00:00:00Z").await.unwrap();
        store.set("person", "2024-02-01T00:00:00Z").await.unwrap();
        store.set("department", "2024-01-15T00:00:00Z").await.unwrap();

        assert_eq!(
            store.get("person").await.unwrap().as_deref(),
            Some("2024-02-01T00:00:00Z")
        );

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "department");
    }
}
