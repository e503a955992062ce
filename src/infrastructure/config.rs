//! Configuration infrastructure
//!
//! Contains configuration loading and management for the phone collector.
//!
//! Values are resolved in three layers, later layers winning:
//! 1. Config file (`<config_dir>/datamaster-collector/config.json`, created on first run)
//! 2. Environment variables (`DATAMASTER_API_URL`, `DATABASE_PATH`, ...)
//! 3. Command line flags (applied by the binary)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Remote API connection
    pub api: ApiConfig,

    /// Traversal pacing and concurrency
    pub collection: CollectionConfig,

    /// Database and checkpoint locations
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Endpoint all commands are POSTed to
    pub url: String,

    /// Access token sent in every request body
    pub token: String,

    pub request_timeout_seconds: u64,

    /// Attempts per request, first one included
    pub max_retries: u32,

    /// Backoff base; attempt n waits `base * 2^(n-1)` plus jitter
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Minimum spacing between any two outbound requests
    pub rate_limit_delay_ms: u64,

    /// 1 selects the sequential orchestrator
    pub workers: usize,

    pub checkpoint_interval: usize,
    pub parallel_checkpoint_interval: usize,
    pub notify_interval: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,

    /// Checkpoint file used by `--continue`
    pub state_file: PathBuf,

    pub max_connections: u32,
}

/// Logging configuration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted file logs
    pub json_format: bool,

    pub console_output: bool,
    pub file_output: bool,

    /// Directory for log files; next to the executable when unset
    pub log_dir: Option<PathBuf>,

    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,

    /// Enable automatic log cleanup on startup
    pub auto_cleanup_logs: bool,

    /// Module-specific log level filters (e.g., "sqlx": "warn", "reqwest": "info")
    pub module_filters: HashMap<String, String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            request_timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            max_retries: defaults::MAX_RETRIES,
            retry_base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            rate_limit_delay_ms: defaults::RATE_LIMIT_DELAY_MS,
            workers: defaults::WORKERS,
            checkpoint_interval: defaults::CHECKPOINT_INTERVAL,
            parallel_checkpoint_interval: defaults::PARALLEL_CHECKPOINT_INTERVAL,
            notify_interval: defaults::NOTIFY_INTERVAL,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(defaults::DATABASE_PATH),
            state_file: PathBuf::from(defaults::STATE_FILE),
            max_connections: defaults::MAX_DB_CONNECTIONS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_filters = HashMap::new();
        module_filters.insert("sqlx".to_string(), "warn".to_string());
        module_filters.insert("reqwest".to_string(), "info".to_string());

        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: None,
            max_files: defaults::MAX_LOG_FILES,
            auto_cleanup_logs: true,
            module_filters,
        }
    }
}

impl ApiConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl CollectionConfig {
    #[must_use]
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }
}

impl AppConfig {
    /// Applies environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Empty values count as unset.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = get(env::API_URL) {
            self.api.url = url;
        }
        if let Some(token) = get(env::API_TOKEN) {
            self.api.token = token;
        }
        if let Some(path) = get(env::DATABASE_PATH) {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Some(path) = get(env::STATE_FILE) {
            self.storage.state_file = PathBuf::from(path);
        }
        if let Some(delay) = get(env::RATE_LIMIT_DELAY) {
            let seconds: f64 = delay
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got {delay:?}", env::RATE_LIMIT_DELAY))?;
            if !seconds.is_finite() || seconds < 0.0 {
                bail!("{} must be a non-negative number of seconds, got {delay:?}", env::RATE_LIMIT_DELAY);
            }
            // float → int casts saturate
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let millis = (seconds * 1000.0).round() as u64;
            self.collection.rate_limit_delay_ms = millis;
        }
        if let Some(timeout) = get(env::REQUEST_TIMEOUT) {
            self.api.request_timeout_seconds = timeout
                .parse()
                .with_context(|| format!("{} must be whole seconds, got {timeout:?}", env::REQUEST_TIMEOUT))?;
        }
        if let Some(retries) = get(env::MAX_RETRIES) {
            self.api.max_retries = retries
                .parse()
                .with_context(|| format!("{} must be a positive integer, got {retries:?}", env::MAX_RETRIES))?;
        }
        if let Some(level) = get(env::LOG_LEVEL) {
            self.logging.level = level.to_lowercase();
        }
        if let Some(dir) = get(env::LOG_DIR) {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Checks what a collection run cannot do without.
    pub fn validate_for_collection(&self) -> Result<()> {
        if self.api.url.is_empty() {
            bail!("API URL is not configured (set {} or api.url)", env::API_URL);
        }
        if self.api.token.is_empty() {
            bail!("API token is not configured (set {} or api.token)", env::API_TOKEN);
        }
        if self.api.max_retries == 0 {
            bail!("api.max_retries must be at least 1");
        }
        Ok(())
    }
}

/// Environment variable names
pub mod env {
    pub const API_URL: &str = "DATAMASTER_API_URL";
    pub const API_TOKEN: &str = "DATAMASTER_API_TOKEN";
    pub const DATABASE_PATH: &str = "DATABASE_PATH";
    pub const STATE_FILE: &str = "STATE_FILE";
    pub const RATE_LIMIT_DELAY: &str = "RATE_LIMIT_DELAY";
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
    pub const MAX_RETRIES: &str = "MAX_RETRIES";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const LOG_DIR: &str = "LOG_DIR";
}

/// Default configuration values
pub mod defaults {
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BASE_DELAY_MS: u64 = 2000;

    pub const RATE_LIMIT_DELAY_MS: u64 = 500;
    pub const WORKERS: usize = 1;
    pub const CHECKPOINT_INTERVAL: usize = 5;
    pub const PARALLEL_CHECKPOINT_INTERVAL: usize = 10;
    pub const NOTIFY_INTERVAL: usize = 50;

    pub const DATABASE_PATH: &str = "data/phones.db";
    pub const STATE_FILE: &str = "data/state.json";
    pub const MAX_DB_CONNECTIONS: u32 = 8;

    pub const LOG_LEVEL: &str = "info";
    pub const MAX_LOG_FILES: u32 = 10;
}

/// Loads and stores the JSON config file.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("datamaster-collector");

        Ok(config_dir)
    }

    /// Manager for the default config location.
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join("config.json");
        Ok(Self { config_path })
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !fs::try_exists(&self.config_path).await.unwrap_or(false) {
            info!("🎉 Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("Failed to read configuration file {:?}", self.config_path))?;

        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("Loaded configuration from: {:?}", self.config_path);
                Ok(config)
            }
            Err(parse_error) => {
                warn!("⚠️  Configuration file is invalid: {}", parse_error);

                let backup_path = self.config_path.with_extension("json.corrupted");
                if let Err(e) = fs::copy(&self.config_path, &backup_path).await {
                    warn!("Failed to create backup of corrupted config: {}", e);
                } else {
                    info!("Backed up corrupted config to: {:?}", backup_path);
                }

                let default_config = AppConfig::default();
                self.save_config(&default_config)
                    .await
                    .context("Failed to save default configuration")?;
                info!("✅ Reset to default configuration");
                Ok(default_config)
            }
        }
    }

    /// File config with environment overrides applied.
    pub async fn load_effective(&self) -> Result<AppConfig> {
        let mut config = self.load_config().await?;
        config.apply_env()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.api.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.api.max_retries, 3);
        assert_eq!(config.collection.rate_limit_delay(), Duration::from_millis(500));
        assert_eq!(config.collection.workers, 1);
        assert_eq!(config.storage.database_path, PathBuf::from("data/phones.db"));
        assert_eq!(config.storage.state_file, PathBuf::from("data/state.json"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(lookup_from(&[
                ("DATAMASTER_API_URL", "https://api.example.test/v1"),
                ("DATAMASTER_API_TOKEN", "secret"),
                ("DATABASE_PATH", "/tmp/x.db"),
                ("RATE_LIMIT_DELAY", "1.25"),
                ("REQUEST_TIMEOUT", "10"),
                ("MAX_RETRIES", "5"),
                ("LOG_LEVEL", "DEBUG"),
            ]))
            .unwrap();

        assert_eq!(config.api.url, "https://api.example.test/v1");
        assert_eq!(config.api.token, "secret");
        assert_eq!(config.storage.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.collection.rate_limit_delay_ms, 1250);
        assert_eq!(config.api.request_timeout_seconds, 10);
        assert_eq!(config.api.max_retries, 5);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate_for_collection().is_ok());
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(lookup_from(&[("DATABASE_PATH", "  ")]))
            .unwrap();
        assert_eq!(config.storage.database_path, PathBuf::from("data/phones.db"));
    }

    #[test]
    fn malformed_numeric_env_is_an_error() {
        let mut config = AppConfig::default();
        assert!(config.apply_env_overrides(lookup_from(&[("MAX_RETRIES", "many")])).is_err());
        assert!(config.apply_env_overrides(lookup_from(&[("RATE_LIMIT_DELAY", "-1")])).is_err());
    }

    #[test]
    fn collection_requires_url_and_token() {
        let config = AppConfig::default();
        assert!(config.validate_for_collection().is_err());
    }

    #[tokio::test]
    async fn first_load_writes_defaults_and_second_load_reads_them() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("cfg").join("config.json"));

        let created = manager.load_config().await.unwrap();
        assert!(manager.config_path().exists());

        let reloaded = manager.load_config().await.unwrap();
        assert_eq!(created, reloaded);
    }

    #[tokio::test]
    async fn partial_file_is_completed_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"api": {"url": "https://x.test"}, "collection": {"workers": 4}}"#).unwrap();

        let config = ConfigManager::with_path(&path).load_config().await.unwrap();
        assert_eq!(config.api.url, "https://x.test");
        assert_eq!(config.api.max_retries, 3);
        assert_eq!(config.collection.workers, 4);
        assert_eq!(config.collection.checkpoint_interval, 5);
    }

    #[tokio::test]
    async fn corrupt_file_is_backed_up_and_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();

        let config = ConfigManager::with_path(&path).load_config().await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.with_extension("json.corrupted").exists());
    }
}
