//! Budget Window Store
//!
//! Persistence for the limiter's budget window so that bytes already
//! consumed in the current period are still counted after a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

use super::budget::BudgetWindow;

/// Error types for budget window persistence
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem error
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored window could not be encoded or decoded
    #[error("invalid budget window record: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Budget window together with the instant it expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedWindow {
    #[serde(flatten)]
    pub window: BudgetWindow,

    /// Next rollover; the window is stale from this instant on
    pub rollover: DateTime<Utc>,
}

impl SavedWindow {
    /// Whether the window still belongs to the period containing `now`
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.rollover > now
    }
}

/// Storage for the limiter's budget window
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Persist `saved`, replacing any previous window
    async fn save(&self, saved: &SavedWindow) -> Result<(), StoreError>;

    /// Last saved window, if any
    async fn load(&self) -> Result<Option<SavedWindow>, StoreError>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct FileBudgetStore {
    path: PathBuf,
}

impl FileBudgetStore {
    /// Store backed by the file at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl BudgetStore for FileBudgetStore {
    async fn save(&self, saved: &SavedWindow) -> Result<(), StoreError> {
        let record = serde_json::to_vec(saved)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error(e))?;
            }
        }

        // Write then rename so a crash never leaves a torn record.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &record)
            .await
            .map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<SavedWindow>, StoreError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemBudgetStore {
    saved: RwLock<Option<SavedWindow>>,
}

impl MemBudgetStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with `saved`
    pub fn with_window(saved: SavedWindow) -> Self {
        Self {
            saved: RwLock::new(Some(saved)),
        }
    }
}

#[async_trait]
impl BudgetStore for MemBudgetStore {
    async fn save(&self, saved: &SavedWindow) -> Result<(), StoreError> {
        *self.saved.write().await = Some(*saved);
        Ok(())
    }

    async fn load(&self) -> Result<Option<SavedWindow>, StoreError> {
        Ok(*self.saved.read().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn saved() -> SavedWindow {
        SavedWindow {
            window: BudgetWindow {
                budget: 1_000_000,
                has_budget: true,
                count: 4321,
            },
            rollover: Utc.with_ymd_and_hms(2030, 3, 12, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_file_store_missing_file() {
        let tmp = TempDir::new().unwrap();
        let store = FileBudgetStore::new(tmp.path().join("window.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let store = FileBudgetStore::new(tmp.path().join("state").join("window.json"));
        store.save(&saved()).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, saved());
        assert!(!tmp.path().join("state").join("window.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("window.json");
        std::fs::write(&path, b"{broken").unwrap();

        let store = FileBudgetStore::new(&path);
        assert!(matches!(store.load().await, Err(StoreError::Codec(_))));
    }

    #[tokio::test]
    async fn test_mem_store() {
        let store = MemBudgetStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.save(&saved()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(saved()));
    }

    #[test]
    fn test_is_current() {
        let s = saved();
        assert!(s.is_current(Utc.with_ymd_and_hms(2030, 3, 11, 23, 0, 0).unwrap()));
        assert!(!s.is_current(s.rollover));
    }
}
