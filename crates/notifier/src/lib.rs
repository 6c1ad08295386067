//! Alert Notification Service
//!
//! The Alertmanager facade that keeps an engine instance in sync with the
//! configuration store, plus the service's settings and telemetry setup.

pub mod alertmanager;
pub mod default_config;
pub mod error;
pub mod settings;
pub mod telemetry;

pub use alertmanager::Alertmanager;
pub use error::AlertmanagerError;
pub use settings::Settings;
