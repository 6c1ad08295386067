//! Built-in Fallback Configuration

use alerting::{ConfigError, UserConfig};

/// Receiver name used by the fallback configuration
pub const DEFAULT_RECEIVER: &str = "grafana-default-email";

/// Configuration applied when nothing has been stored for the org
pub const DEFAULT_CONFIGURATION: &str = r#"{
    "template_files": {},
    "alertmanager_config": {
        "route": {
            "receiver": "grafana-default-email"
        },
        "receivers": [{
            "name": "grafana-default-email",
            "grafana_managed_receiver_configs": [{
                "uid": "",
                "name": "email receiver",
                "type": "email",
                "isDefault": true,
                "settings": {
                    "addresses": "<example@email.com>"
                }
            }]
        }]
    }
}"#;

/// Raw fallback document
pub fn default_configuration() -> &'static str {
    DEFAULT_CONFIGURATION
}

/// Parsed fallback document
pub fn default_user_config() -> Result<UserConfig, ConfigError> {
    UserConfig::parse(DEFAULT_CONFIGURATION)
}
