//! Alertmanager Error Types

use alerting::{AlertError, BuildError, ConfigError};
use storage::StorageError;
use thiserror::Error;

/// Errors returned by the Alertmanager facade
#[derive(Debug, Error)]
pub enum AlertmanagerError {
    /// Configuration store unreachable or returned a corrupt record
    #[error("Failed to retrieve configuration: {0}")]
    Retrieval(#[source] StorageError),

    /// Stored configuration could not be parsed or validated
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Engine instance could not be assembled
    #[error("Failed to build engine instance: {0}")]
    Build(#[from] BuildError),

    /// Provider rejected the alert batch
    #[error("Failed to ingest alerts: {0}")]
    Ingestion(#[from] AlertError),

    /// Writing a configuration revision failed
    #[error("Failed to save configuration: {0}")]
    Store(#[source] StorageError),

    /// No live engine instance
    #[error("Alertmanager is not initialized")]
    NotInitialized,

    #[error("Data directory error: {0}")]
    Io(#[from] std::io::Error),
}
