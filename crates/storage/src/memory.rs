//! In-Memory Configuration Store

use crate::{ConfigStore, SaveConfigCmd, StorageError, StoredConfig};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;
use tracing::{debug, info};

/// Configuration store kept in process memory
pub struct MemoryConfigStore {
    /// All revisions, in insertion order
    configs: Mutex<Vec<StoredConfig>>,
    /// Max revisions kept per org
    max_revisions: usize,
    /// Next revision ID
    next_id: Mutex<i64>,
}

impl MemoryConfigStore {
    /// Create an empty store
    pub fn new() -> Self {
        info!("Creating in-memory configuration store");
        Self {
            configs: Mutex::new(Vec::new()),
            max_revisions: 100,
            next_id: Mutex::new(1),
        }
    }

    /// Number of revisions currently held
    pub fn revision_count(&self) -> usize {
        self.configs.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Remove all revisions (for testing)
    pub fn clear(&self) {
        if let Ok(mut configs) = self.configs.lock() {
            configs.clear();
        }
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_latest_config(&self, org_id: i64) -> Result<Option<StoredConfig>, StorageError> {
        let configs = self.configs.lock().map_err(|e| {
            StorageError::DatabaseError(format!("Lock error: {}", e))
        })?;

        Ok(configs
            .iter()
            .filter(|c| c.org_id == org_id)
            .max_by_key(|c| c.id)
            .cloned())
    }

    async fn save_config(&self, org_id: i64, cmd: SaveConfigCmd) -> Result<(), StorageError> {
        let mut configs = self.configs.lock().map_err(|e| {
            StorageError::DatabaseError(format!("Lock error: {}", e))
        })?;

        let mut id = self.next_id.lock().map_err(|e| {
            StorageError::DatabaseError(format!("Lock error: {}", e))
        })?;

        let record = StoredConfig {
            id: *id,
            org_id,
            configuration: cmd.configuration,
            configuration_version: cmd.configuration_version,
            created_at: Utc::now(),
            is_default: cmd.is_default,
        };
        *id += 1;

        // Enforce retention within this org; the new record becomes its latest
        let org_revisions = configs.iter().filter(|c| c.org_id == org_id).count();
        if org_revisions >= self.max_revisions.max(1) {
            if let Some(oldest) = configs.iter().position(|c| c.org_id == org_id) {
                configs.remove(oldest);
            }
        }

        debug!("Saved configuration revision {} for org {}", record.id, org_id);
        configs.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_config_is_none() {
        let store = MemoryConfigStore::new();
        assert!(store.get_latest_config(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_revision_wins() {
        let store = MemoryConfigStore::new();
        store.save_config(1, SaveConfigCmd::new("{\"a\":1}", "v1")).await.unwrap();
        store.save_config(1, SaveConfigCmd::new("{\"a\":2}", "v1")).await.unwrap();
        store.save_config(2, SaveConfigCmd::new("{\"b\":1}", "v1")).await.unwrap();

        let latest = store.get_latest_config(1).await.unwrap().unwrap();
        assert_eq!(latest.configuration, "{\"a\":2}");
        assert_eq!(latest.org_id, 1);
        assert_eq!(store.revision_count(), 3);
    }

    #[tokio::test]
    async fn test_retention_limit() {
        let mut store = MemoryConfigStore::new();
        store.max_revisions = 3;

        for i in 0..10 {
            store
                .save_config(1, SaveConfigCmd::new(format!("{{\"rev\":{}}}", i), "v1"))
                .await
                .unwrap();
        }

        assert_eq!(store.revision_count(), 3);
        let latest = store.get_latest_config(1).await.unwrap().unwrap();
        assert_eq!(latest.configuration, "{\"rev\":9}");
    }

    #[tokio::test]
    async fn test_retention_is_per_org() {
        let mut store = MemoryConfigStore::new();
        store.max_revisions = 3;

        store.save_config(1, SaveConfigCmd::new("{\"org\":1}", "v1")).await.unwrap();
        for i in 0..10 {
            store
                .save_config(2, SaveConfigCmd::new(format!("{{\"rev\":{}}}", i), "v1"))
                .await
                .unwrap();
        }

        let org1 = store.get_latest_config(1).await.unwrap().unwrap();
        assert_eq!(org1.configuration, "{\"org\":1}");
        let org2 = store.get_latest_config(2).await.unwrap().unwrap();
        assert_eq!(org2.configuration, "{\"rev\":9}");
        assert_eq!(store.revision_count(), 4);
    }
}
