// Configuration File Support
//
// TOML configuration for the relay with environment variable overrides.
// A missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::limiter::budget::{MAX_PLAN_DATE, MIN_PLAN_DATE};
use crate::limiter::{CellularConfig, DataLimit, StorageConfig};
use crate::logging::LoggingConfig;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "metered-relay.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Durable queue configuration
    pub queue: QueueConfig,

    /// Metered-network budget
    pub cellular: CellularSettings,

    /// File holding the budget window between runs
    pub state_file: Option<PathBuf>,

    /// Backend data-limit document; overrides `queue.storage_limit_mb`
    /// and `[cellular]` when set
    pub data_limit_file: Option<PathBuf>,
}

/// Durable queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory holding unsent messages
    pub dir: PathBuf,

    /// Storage limit in megabytes (unlimited if not set)
    pub storage_limit_mb: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".metered-relay/message"),
            storage_limit_mb: None,
        }
    }
}

/// Metered-network budget settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CellularSettings {
    /// Megabytes per billing period (unmetered if not set)
    pub limit_mb: Option<u64>,

    /// Day of the month the billing period starts
    pub plan_date: u32,
}

impl Default for CellularSettings {
    fn default() -> Self {
        Self {
            limit_mb: None,
            plan_date: MIN_PLAN_DATE,
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or is
    /// invalid. If the config file does not exist, defaults are used.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path
    pub fn config_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables take precedence over config file values:
    /// - METERED_RELAY_LOG_LEVEL
    /// - METERED_RELAY_LOG_FORMAT
    /// - METERED_RELAY_QUEUE_DIR
    /// - METERED_RELAY_STORAGE_LIMIT_MB
    /// - METERED_RELAY_CELLULAR_LIMIT_MB
    /// - METERED_RELAY_PLAN_DATE
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`; unparsable values are ignored
    fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("METERED_RELAY_LOG_LEVEL").and_then(|v| v.parse().ok()) {
            self.logging.level = level;
        }
        if let Some(format) = lookup("METERED_RELAY_LOG_FORMAT").and_then(|v| v.parse().ok()) {
            self.logging.format = format;
        }
        if let Some(dir) = lookup("METERED_RELAY_QUEUE_DIR") {
            self.queue.dir = PathBuf::from(dir);
        }
        if let Some(mb) = lookup("METERED_RELAY_STORAGE_LIMIT_MB").and_then(|v| v.parse().ok()) {
            self.queue.storage_limit_mb = Some(mb);
        }
        if let Some(mb) = lookup("METERED_RELAY_CELLULAR_LIMIT_MB").and_then(|v| v.parse().ok()) {
            self.cellular.limit_mb = Some(mb);
        }
        if let Some(day) = lookup("METERED_RELAY_PLAN_DATE").and_then(|v| v.parse::<u32>().ok()) {
            if (MIN_PLAN_DATE..=MAX_PLAN_DATE).contains(&day) {
                self.cellular.plan_date = day;
            }
        }
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.queue.dir.as_os_str().is_empty() {
            anyhow::bail!("Queue directory must not be empty");
        }
        if self.queue.storage_limit_mb == Some(0) {
            anyhow::bail!("Storage limit must be > 0 MB when set");
        }
        if !(MIN_PLAN_DATE..=MAX_PLAN_DATE).contains(&self.cellular.plan_date) {
            anyhow::bail!(
                "Invalid plan date: {}. Must be within [{}, {}]",
                self.cellular.plan_date,
                MIN_PLAN_DATE,
                MAX_PLAN_DATE
            );
        }
        Ok(())
    }

    /// Data limits in effect
    ///
    /// Read from `data_limit_file` when configured, otherwise built from the
    /// `[queue]` and `[cellular]` sections.
    pub fn data_limit(&self) -> Result<DataLimit> {
        let Some(path) = &self.data_limit_file else {
            return Ok(DataLimit {
                emission_period: 0,
                storage: StorageConfig {
                    limit: self.queue.storage_limit_mb,
                },
                cellular: CellularConfig {
                    limit: self.cellular.limit_mb,
                    date: self.cellular.plan_date,
                },
            });
        };

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read data limit document from {:?}", path))?;
        DataLimit::from_json(&content)
            .with_context(|| format!("Failed to parse data limit document from {:?}", path))
    }

    /// Load the configuration at `path` afresh and return its data limits
    ///
    /// Used on reload, so edits to either the TOML file or the data-limit
    /// document it points at take effect.
    pub fn reload_data_limit<P: AsRef<Path>>(path: P) -> Result<DataLimit> {
        Self::load_from_path(path)?.data_limit()
    }
}
