//! Application settings: TOML file plus `ROSTER_SYNC_*` environment overrides

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::clients::{DataverseConfig, HttpSourceConfig};
use crate::pipeline::{BackpressureConfig, SyncSettings};

const APP_DIR: &str = "roster-sync";

/// Everything read from `settings.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub source: HttpSourceConfig,
    pub target: DataverseConfig,
    pub sync: SyncSettings,
    pub backpressure: BackpressureConfig,
    /// SQLite file holding watermarks
    pub watermark_db: Option<PathBuf>,
}

/// Default settings file (~/.config/roster-sync/settings.toml)
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("settings.toml")
}

/// Default watermark database (~/.local/share/roster-sync/watermarks.db)
pub fn default_watermark_db() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("watermarks.db")
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid settings file")
    }

    /// Load settings from `path`, or from the default location.
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_settings_path(), false),
        };

        if !path.exists() {
            if explicit {
                anyhow::bail!("Settings file does not exist: {}", path.display());
            }
            log::debug!("No settings file at {}, using defaults", path.display());
            return Ok(Settings::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Apply `ROSTER_SYNC_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("ROSTER_SYNC_SOURCE_URL") {
            self.source.base_url = url;
        }
        if let Some(url) = lookup("ROSTER_SYNC_TARGET_URL") {
            self.target.url = url;
        }
        if let Some(value) = lookup("ROSTER_SYNC_BATCH_SIZE") {
            self.sync.batch_size = parse_number("ROSTER_SYNC_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("ROSTER_SYNC_MAX_WORKERS") {
            self.sync.max_workers = parse_number("ROSTER_SYNC_MAX_WORKERS", &value)?;
        }
        if let Some(value) = lookup("ROSTER_SYNC_RECORD_LIMIT") {
            self.sync.record_limit = Some(parse_number("ROSTER_SYNC_RECORD_LIMIT", &value)?);
        }
        if let Some(path) = lookup("ROSTER_SYNC_WATERMARK_DB") {
            self.watermark_db = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Run tunables with the top-level backpressure thresholds folded in
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            backpressure: self.backpressure.clone(),
            ..self.sync.clone()
        }
    }

    pub fn watermark_path(&self) -> PathBuf {
        self.watermark_db.clone().unwrap_or_else(default_watermark_db)
    }

    /// Source bearer token; optional since some HR APIs sit behind a gateway
    pub fn source_token(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        lookup(&self.source.token_env).filter(|t| !t.is_empty())
    }

    /// Target bearer token; required
    pub fn target_token(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
        lookup(&self.target.token_env)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("Target token not set; export {}", self.target.token_env))
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_parse_settings_file() {
        let settings = Settings::from_toml_str(
            r#"
            watermark_db = "/var/lib/roster-sync/wm.db"

            [source]
            base_url = "https://hr.example.com/api"
            page_size = 250

            [target]
            url = "https://contoso.crm4.dynamics.com"

            [target.overrides]
            Name = "hr_personnames"

            [sync]
            batch_size = 100
            max_workers = 5
            max_drain = 30

            [backpressure]
            warn_percent = 70
            hard_percent = 90
            settle = 2.5
            "#,
        )
        .unwrap();

        assert_eq!(settings.source.page_size, 250);
        assert_eq!(settings.source.items_key, "items");
        assert_eq!(settings.target.names.entity_set("Name"), "hr_personnames");
        assert_eq!(settings.sync.batch_size, 100);
        assert_eq!(settings.sync.max_drain, Duration::from_secs(30));
        assert_eq!(settings.watermark_path(), PathBuf::from("/var/lib/roster-sync/wm.db"));

        let sync = settings.sync_settings();
        assert_eq!(sync.max_workers, 5);
        assert_eq!(sync.backpressure.warn_percent, 70.0);
        assert_eq!(sync.backpressure.settle, Duration::from_millis(2500));
    }

    #[test]
    fn test_demo_settings_parse() {
        let settings = Settings::from_toml_str(include_str!("../../demos/settings.toml")).unwrap();
        assert_eq!(settings.target.retry.max_attempts, 5);
        assert_eq!(settings.target.names.entity_set("hr_personname"), "hr_personnames");
        assert_eq!(settings.sync.max_run, Duration::from_secs(14400));
    }

    #[test]
    fn test_defaults_when_empty() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.sync.batch_size, 200);
        assert!(settings.watermark_path().ends_with("roster-sync/watermarks.db"));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_overrides(env(&[
                ("ROSTER_SYNC_SOURCE_URL", "https://hr.internal"),
                ("ROSTER_SYNC_BATCH_SIZE", "50"),
                ("ROSTER_SYNC_RECORD_LIMIT", "1000"),
            ]))
            .unwrap();

        assert_eq!(settings.source.base_url, "https://hr.internal");
        assert_eq!(settings.sync.batch_size, 50);
        assert_eq!(settings.sync.record_limit, Some(1000));
        assert_eq!(settings.sync.max_workers, 3);

        let err = settings
            .apply_overrides(env(&[("ROSTER_SYNC_MAX_WORKERS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("ROSTER_SYNC_MAX_WORKERS"));
    }

    #[test]
    fn test_tokens_come_from_environment() {
        let settings = Settings::default();
        let lookup = env(&[("ROSTER_SYNC_TARGET_TOKEN", "secret")]);

        assert_eq!(settings.target_token(&lookup).unwrap(), "secret");
        assert_eq!(settings.source_token(&lookup), None);
        assert!(settings.target_token(env(&[])).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/roster-sync.toml"))).is_err());
    }
}
