//! Storage Layer
//!
//! Persists the notification configuration document per organization.
//! Two backends share the [`ConfigStore`] contract: an in-memory store for
//! tests and embedded use, and a SQLite store backed by `sqlx`.

mod memory;
mod repository;
mod sqlite;

pub use memory::MemoryConfigStore;
pub use repository::{ConfigStore, SaveConfigCmd, StoredConfig};
pub use sqlite::SqliteConfigStore;

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Record not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            other => StorageError::DatabaseError(other.to_string()),
        }
    }
}
