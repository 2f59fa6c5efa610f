//! Configuration loader and validator for the inventory sync service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::outbox::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_BACKOFF_SECONDS, MAX_BATCH_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub inventory: Inventory,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    #[serde(default = "default_outbox_batch_size")]
    pub outbox_batch_size: i64,
    #[serde(default = "default_outbox_lease_seconds")]
    pub outbox_lease_seconds: u64,
    /// Cap on the retry delay after a rejected follow-up delivery.
    #[serde(default = "default_outbox_max_backoff_seconds")]
    pub outbox_max_backoff_seconds: u64,
    /// Seconds between scheduled background syncs; 0 disables the schedule.
    #[serde(default)]
    pub sync_interval_seconds: u64,
}

/// External inventory API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inventory {
    pub base_url: String,
    pub app_token: String,
    pub user_token: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_outbox_batch_size() -> i64 {
    DEFAULT_BATCH_SIZE
}

fn default_outbox_max_backoff_seconds() -> u64 {
    DEFAULT_MAX_BACKOFF_SECONDS
}

fn default_outbox_lease_seconds() -> u64 {
    120
}

fn default_collection() -> String {
    "Computer".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins; otherwise a SQLite file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/inventory.db", self.app.data_dir))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.poll_interval_ms)
    }

    pub fn outbox_lease(&self) -> Duration {
        Duration::from_secs(self.app.outbox_lease_seconds)
    }

    pub fn outbox_max_backoff(&self) -> Duration {
        Duration::from_secs(self.app.outbox_max_backoff_seconds)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        match self.app.sync_interval_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.inventory.timeout_seconds)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if !(1..=MAX_BATCH_SIZE).contains(&cfg.app.outbox_batch_size) {
        return Err(ConfigError::Invalid(
            "app.outbox_batch_size must be between 1 and 200",
        ));
    }
    if cfg.app.outbox_lease_seconds == 0 {
        return Err(ConfigError::Invalid("app.outbox_lease_seconds must be > 0"));
    }
    if cfg.app.outbox_max_backoff_seconds == 0 {
        return Err(ConfigError::Invalid(
            "app.outbox_max_backoff_seconds must be > 0",
        ));
    }

    if cfg.inventory.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("inventory.base_url must be non-empty"));
    }
    if cfg.inventory.app_token.trim().is_empty() {
        return Err(ConfigError::Invalid("inventory.app_token must be non-empty"));
    }
    if cfg.inventory.user_token.trim().is_empty() {
        return Err(ConfigError::Invalid("inventory.user_token must be non-empty"));
    }
    if cfg.inventory.collection.trim().is_empty() {
        return Err(ConfigError::Invalid("inventory.collection must be non-empty"));
    }
    if cfg.inventory.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("inventory.timeout_seconds must be > 0"));
    }

    Ok(())
}

/// Example configuration with every key spelled out.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 5000
  outbox_batch_size: 25
  outbox_lease_seconds: 120
  outbox_max_backoff_seconds: 3600
  sync_interval_seconds: 3600

inventory:
  base_url: "https://glpi.example.org/apirest.php/"
  app_token: "YOUR_APP_TOKEN"
  user_token: "YOUR_USER_TOKEN"
  collection: "Computer"
  timeout_seconds: 30
"#
}
