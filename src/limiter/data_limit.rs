//! Data Limit Configuration
//!
//! Parameters controlling how much data the relay may use, as delivered by
//! the backend: a storage limit for unsent messages and a metered-network
//! budget with its billing-cycle day. Retrieving the document is left to the
//! caller; this module parses, validates and applies it.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::budget::{BYTES_PER_MEGABYTE, MAX_PLAN_DATE, MIN_PLAN_DATE};
use crate::queue::Persistor;

/// Error types for data limit documents
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Document is not valid JSON of the expected shape
    #[error("invalid data limit document: {0}")]
    Parse(#[from] serde_json::Error),

    /// Billing-cycle day outside [1, 28]
    #[error("billing cycle day {0} is outside [1, 28]")]
    InvalidPlanDate(u32),
}

/// Metered-network budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellularConfig {
    /// Megabytes per period the relay may send over a metered connection;
    /// `None` means unmetered
    #[serde(rename = "cellular_data_limit", default)]
    pub limit: Option<u64>,

    /// Day of the month on which a period starts
    #[serde(rename = "normalized_cell_plan_date", default)]
    pub date: u32,
}

impl CellularConfig {
    /// Check the billing-cycle day
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PLAN_DATE..=MAX_PLAN_DATE).contains(&self.date) {
            return Err(ConfigError::InvalidPlanDate(self.date));
        }
        Ok(())
    }
}

/// Storage limit for unsent messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Megabytes available to the durable queue; `None` means no limit
    #[serde(rename = "storage_limit", default)]
    pub limit: Option<u64>,
}

impl StorageConfig {
    /// Limit in bytes
    pub fn limit_bytes(&self) -> Option<u64> {
        self.limit.map(|mb| mb.saturating_mul(BYTES_PER_MEGABYTE))
    }
}

/// Data usage parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLimit {
    /// Seconds between emission requests to the instrumented application
    #[serde(default)]
    pub emission_period: u64,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(rename = "data", default)]
    pub cellular: CellularConfig,
}

#[derive(Deserialize)]
struct Envelope {
    config: DataLimit,
}

impl DataLimit {
    /// Parse the backend's `{"config": {...}}` document
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        envelope.config.validate()?;
        Ok(envelope.config)
    }

    /// Validate the document
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cellular.validate()
    }

    /// Push the storage limit to `persistor` and the cellular budget to the
    /// limiter's configuration stream
    ///
    /// A closed channel on either side is logged and skipped.
    pub async fn apply(&self, persistor: &Persistor, cellular: &mpsc::Sender<CellularConfig>) {
        if persistor
            .configure()
            .send(self.storage.limit_bytes())
            .await
            .is_err()
        {
            warn!("Storage limit update dropped, queue is shut down");
        }
        if cellular.send(self.cellular).await.is_err() {
            warn!("Cellular budget update dropped, limiter has exited");
        }
        info!(
            "Applied data limits: storage={:?}MB cellular={:?}MB plan_date={}",
            self.storage.limit, self.cellular.limit, self.cellular.date
        );
    }
}
