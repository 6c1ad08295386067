//! Configuration Store Contract

use crate::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted notification configuration revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConfig {
    pub id: i64,
    pub org_id: i64,
    /// Raw configuration document (JSON)
    pub configuration: String,
    pub configuration_version: String,
    pub created_at: DateTime<Utc>,
    /// Whether this revision was written from the built-in default
    pub is_default: bool,
}

/// Command for saving a new configuration revision
#[derive(Debug, Clone)]
pub struct SaveConfigCmd {
    pub configuration: String,
    pub configuration_version: String,
    pub is_default: bool,
}

impl SaveConfigCmd {
    /// Create a save command for a non-default document
    pub fn new(configuration: impl Into<String>, configuration_version: impl Into<String>) -> Self {
        Self {
            configuration: configuration.into(),
            configuration_version: configuration_version.into(),
            is_default: false,
        }
    }
}

/// Read/write access to the latest notification configuration of an org.
///
/// Revisions are append-only: saving never mutates an older revision, and
/// "latest" is the revision with the highest id.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Latest configuration for `org_id`, or `Ok(None)` when none was ever saved.
    async fn get_latest_config(&self, org_id: i64) -> Result<Option<StoredConfig>, StorageError>;

    /// Append a new configuration revision for `org_id`.
    async fn save_config(&self, org_id: i64, cmd: SaveConfigCmd) -> Result<(), StorageError>;
}
