//! SQLite Configuration Store

use crate::{ConfigStore, SaveConfigCmd, StorageError, StoredConfig};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS alert_configuration (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    alertmanager_configuration TEXT NOT NULL,
    configuration_version TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0
)";

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_alert_configuration_org_id ON alert_configuration (org_id)";

/// Configuration store persisted in SQLite
pub struct SqliteConfigStore {
    pool: SqlitePool,
}

impl SqliteConfigStore {
    /// Open (creating if missing) the database at `url` and bootstrap the schema
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        info!("Opened SQLite configuration store at {}", url);
        Self::with_pool(pool).await
    }

    /// Private in-memory database, held on a single connection
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_INDEX).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Close the underlying pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_config(row: &SqliteRow) -> Result<StoredConfig, StorageError> {
    let created_at: i64 = row.try_get("created_at")?;
    let created_at = Utc
        .timestamp_opt(created_at, 0)
        .single()
        .ok_or_else(|| {
            StorageError::SerializationError(format!("invalid created_at {}", created_at))
        })?;

    Ok(StoredConfig {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        configuration: row.try_get("alertmanager_configuration")?,
        configuration_version: row.try_get("configuration_version")?,
        created_at,
        is_default: row.try_get("is_default")?,
    })
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn get_latest_config(&self, org_id: i64) -> Result<Option<StoredConfig>, StorageError> {
        let row = sqlx::query(
            "SELECT id, org_id, alertmanager_configuration, configuration_version,
                    created_at, is_default
             FROM alert_configuration WHERE org_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_config).transpose()
    }

    async fn save_config(&self, org_id: i64, cmd: SaveConfigCmd) -> Result<(), StorageError> {
        let result = sqlx::query(
            "INSERT INTO alert_configuration
             (org_id, alertmanager_configuration, configuration_version, created_at, is_default)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(org_id)
        .bind(&cmd.configuration)
        .bind(&cmd.configuration_version)
        .bind(Utc::now().timestamp())
        .bind(cmd.is_default)
        .execute(&self.pool)
        .await?;

        debug!(
            "Saved configuration revision {} for org {}",
            result.last_insert_rowid(),
            org_id
        );
        Ok(())
    }
}
