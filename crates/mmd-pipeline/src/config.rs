use std::path::PathBuf;
use std::time::Duration;

use mmd_storage::{BackoffPolicy, CatalogStore, StoreConfig, StoreError, DEFAULT_SNAPSHOT_RETENTION};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/master.db";
pub const DEFAULT_EXPORT_PATH: &str = "./public/data/metric-synonyms.json";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub export_path: PathBuf,
    pub statement_timeout: Duration,
    pub max_connections: u32,
    pub commit_retries: usize,
    /// Version snapshots kept for restore; 0 keeps every one.
    pub snapshot_retention: usize,
    pub auto_map_threshold: f64,
    pub web_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            export_path: PathBuf::from(DEFAULT_EXPORT_PATH),
            statement_timeout: Duration::from_secs(30),
            max_connections: 4,
            commit_retries: 2,
            snapshot_retention: DEFAULT_SNAPSHOT_RETENTION,
            auto_map_threshold: crate::resolve::AUTO_MAP_THRESHOLD,
            web_port: 8000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str| text(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: text("MMD_DATABASE_URL")
                .or_else(|| text("DATABASE_URL"))
                .unwrap_or(defaults.database_url),
            export_path: text("MMD_EXPORT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_path),
            statement_timeout: number("MMD_STATEMENT_TIMEOUT_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.statement_timeout),
            max_connections: number("MMD_DB_MAX_CONNECTIONS")
                .filter(|v| *v > 0)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.max_connections),
            commit_retries: number("MMD_COMMIT_RETRIES")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.commit_retries),
            snapshot_retention: number("MMD_SNAPSHOT_RETENTION")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.snapshot_retention),
            auto_map_threshold: text("MMD_AUTO_MAP_THRESHOLD")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(defaults.auto_map_threshold),
            web_port: number("MMD_WEB_PORT")
                .filter(|v| *v > 0)
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(defaults.web_port),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            max_connections: self.max_connections,
            statement_timeout: self.statement_timeout,
            snapshot_retention: self.snapshot_retention,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.commit_retries,
            ..BackoffPolicy::default()
        }
    }

    /// Connect to the configured catalog and make sure the schema exists.
    pub async fn open_store(&self) -> Result<CatalogStore, StoreError> {
        let store = CatalogStore::connect(&self.store_config()).await?;
        store.migrate().await?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = EngineConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.export_path, PathBuf::from(DEFAULT_EXPORT_PATH));
        assert_eq!(config.statement_timeout, Duration::from_secs(30));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.commit_retries, 2);
        assert_eq!(config.snapshot_retention, 100);
        assert_eq!(config.web_port, 8000);
        assert!((config.auto_map_threshold - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn prefixed_database_url_wins_over_generic() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite://generic.db"),
            ("MMD_DATABASE_URL", "sqlite://catalog.db"),
        ]));
        assert_eq!(config.database_url, "sqlite://catalog.db");

        let fallback = EngineConfig::from_lookup(lookup(&[("DATABASE_URL", "sqlite://generic.db")]));
        assert_eq!(fallback.database_url, "sqlite://generic.db");
    }

    #[test]
    fn snapshot_retention_reaches_the_store_config() {
        let config = EngineConfig::from_lookup(lookup(&[("MMD_SNAPSHOT_RETENTION", "0")]));
        assert_eq!(config.snapshot_retention, 0);
        assert_eq!(config.store_config().snapshot_retention, 0);

        let capped = EngineConfig::from_lookup(lookup(&[("MMD_SNAPSHOT_RETENTION", "12")]));
        assert_eq!(capped.store_config().snapshot_retention, 12);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MMD_STATEMENT_TIMEOUT_SECS", "0"),
            ("MMD_DB_MAX_CONNECTIONS", "many"),
            ("MMD_COMMIT_RETRIES", "0"),
            ("MMD_AUTO_MAP_THRESHOLD", "1.5"),
            ("MMD_WEB_PORT", "70000"),
        ]));
        assert_eq!(config.statement_timeout, Duration::from_secs(30));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.commit_retries, 0);
        assert!((config.auto_map_threshold - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.web_port, 8000);
        assert_eq!(config.backoff().max_retries, 0);
    }
}
