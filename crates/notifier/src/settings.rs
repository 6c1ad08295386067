//! Service Settings
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `config/alert-pipeline.{toml,yaml,json}` file, then `ALERT_PIPELINE__*`
//! environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sub-directory of `data_path` holding engine state
pub const ALERTING_DIR: &str = "alerting";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root data directory; engine state lives in `<data_path>/alerting`
    pub data_path: PathBuf,
    /// Organization whose configuration is synced
    pub org_id: i64,
    /// SQLite URL of the configuration store
    pub database_url: String,
    /// Seconds between configuration syncs
    pub sync_interval_secs: u64,
    /// Log level filter (e.g. `info`, `notifier=debug`)
    pub log_level: String,
    /// Emit logs as JSON
    pub log_json: bool,
    /// Prometheus exporter listen address; disabled when unset
    pub metrics_addr: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
            org_id: 1,
            database_url: "sqlite://data/alert-pipeline.db".to_string(),
            sync_interval_secs: 60,
            log_level: "info".to_string(),
            log_json: false,
            metrics_addr: None,
        }
    }
}

impl Settings {
    /// Load settings from the default file location and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new("config/alert-pipeline"))
    }

    /// Load settings with `file` (extension optional) as the file layer
    pub fn load_from(file: &Path) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        Config::builder()
            .set_default("data_path", defaults.data_path.to_string_lossy().to_string())?
            .set_default("org_id", defaults.org_id)?
            .set_default("database_url", defaults.database_url)?
            .set_default("sync_interval_secs", defaults.sync_interval_secs)?
            .set_default("log_level", defaults.log_level)?
            .set_default("log_json", defaults.log_json)?
            .add_source(File::with_name(&file.to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("ALERT_PIPELINE").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Directory for engine state files (silences, notification log)
    pub fn alerting_dir(&self) -> PathBuf {
        self.data_path.join(ALERTING_DIR)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("missing")).unwrap();
        assert_eq!(settings.org_id, 1);
        assert_eq!(settings.sync_interval(), Duration::from_secs(60));
        assert!(settings.metrics_addr.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("alert-pipeline.toml");
        std::fs::write(
            &file,
            concat!(
                "org_id = 42\n",
                "data_path = \"/var/lib/alerts\"\n",
                "sync_interval_secs = 15\n",
                "metrics_addr = \"127.0.0.1:9093\"\n",
            ),
        )
        .unwrap();

        let settings = Settings::load_from(&dir.path().join("alert-pipeline")).unwrap();
        assert_eq!(settings.org_id, 42);
        assert_eq!(settings.alerting_dir(), PathBuf::from("/var/lib/alerts/alerting"));
        assert_eq!(settings.sync_interval_secs, 15);
        assert_eq!(settings.metrics_addr.as_deref(), Some("127.0.0.1:9093"));
    }
}
