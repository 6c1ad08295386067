//! Alerting Engine
//!
//! Canonical alert model, the resolve-timeout normalizer, and the engine
//! instance that routes, inhibits, silences and dispatches alerts to
//! receivers for one configuration snapshot.

pub mod alert;
pub mod config;
pub mod dispatch;
pub mod inhibit;
pub mod instance;
pub mod matcher;
pub mod nflog;
pub mod normalizer;
pub mod provider;
pub mod receiver;
pub mod route;
pub mod silence;

pub use alert::{Alert, Fingerprint, LabelSet, PostableAlert, PostableAlerts};
pub use config::UserConfig;
pub use instance::{EngineInstance, InstanceState};
pub use normalizer::{normalize, normalize_batch, DEFAULT_RESOLVE_TIMEOUT};
pub use provider::{AlertIterator, AlertProvider, MemAlertProvider};
pub use receiver::{IntegrationFactory, IntegrationRegistry, Notifier, NotifyError};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised while accepting or looking up alerts
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Invalid labels: {0}")]
    InvalidLabels(String),
    #[error("Start time {starts_at} is after end time {ends_at}")]
    InvalidTimes {
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    },
    #[error("Invalid silence: {0}")]
    InvalidSilence(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Engine instance is not live (state {0})")]
    NotLive(String),
    #[error("Provider error: {0}")]
    Provider(String),
}

/// Errors in the configuration document
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid matcher: {0}")]
    Matcher(String),
}

/// Errors while assembling an engine instance
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Receiver error: {0}")]
    Receiver(String),
    #[error("Data directory error: {0}")]
    Io(#[from] std::io::Error),
}
