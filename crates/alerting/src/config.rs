//! Notification Configuration Document
//!
//! The document persisted by the configuration store. Parsing validates the
//! route tree against the receiver list; equality is structural so that an
//! unchanged document can be detected without rebuilding anything.

use crate::matcher::Matcher;
use crate::ConfigError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Default `group_wait` for routes that do not set one
pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);
/// Default `group_interval`
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default `repeat_interval`
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// Top-level user configuration: templates plus the alertmanager section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub template_files: BTreeMap<String, String>,
    pub alertmanager_config: AlertmanagerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertmanagerConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    pub route: RouteConfig,
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
    #[serde(default)]
    pub inhibit_rules: Vec<InhibitRuleConfig>,
    #[serde(default)]
    pub templates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Resolve timeout applied to alerts that arrive without an end time
    #[serde(default = "default_resolve_timeout", with = "duration")]
    pub resolve_timeout: Duration,
}

fn default_resolve_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: default_resolve_timeout(),
        }
    }
}

/// A node of the routing tree. Unset fields inherit from the parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<Matcher>,
    #[serde(default, rename = "continue")]
    pub continue_matching: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_opt")]
    pub group_wait: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_opt")]
    pub group_interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_opt")]
    pub repeat_interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub name: String,
    #[serde(default)]
    pub grafana_managed_receiver_configs: Vec<IntegrationConfig>,
}

/// One delivery integration of a receiver (email, webhook, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, rename = "disableResolveMessage")]
    pub disable_resolve_message: bool,
    #[serde(default, rename = "isDefault")]
    pub is_default: bool,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl IntegrationConfig {
    /// String setting by key, ignoring blanks
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InhibitRuleConfig {
    #[serde(default)]
    pub source_matchers: Vec<Matcher>,
    #[serde(default)]
    pub target_matchers: Vec<Matcher>,
    #[serde(default)]
    pub equal: Vec<String>,
}

impl UserConfig {
    /// Parse and validate a raw JSON document
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: UserConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to JSON for storage
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Structural checks that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let am = &self.alertmanager_config;

        let resolve_timeout = am.global.resolve_timeout;
        let representable = chrono::Duration::from_std(resolve_timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .is_some();
        if !representable {
            return Err(ConfigError::Validation(format!(
                "resolve_timeout {} is out of range",
                format_duration(resolve_timeout)
            )));
        }

        let mut names = HashSet::new();
        for receiver in &am.receivers {
            if receiver.name.is_empty() {
                return Err(ConfigError::Validation("receiver with empty name".to_string()));
            }
            if !names.insert(receiver.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "receiver {:?} defined more than once",
                    receiver.name
                )));
            }
            for integration in &receiver.grafana_managed_receiver_configs {
                if integration.kind.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "receiver {:?} has an integration without a type",
                        receiver.name
                    )));
                }
            }
        }

        let root_receiver = am.route.receiver.as_deref().ok_or_else(|| {
            ConfigError::Validation("root route must specify a receiver".to_string())
        })?;
        if !am.route.matchers.is_empty() {
            return Err(ConfigError::Validation("root route must not have matchers".to_string()));
        }
        validate_route(&am.route, root_receiver, &names)?;

        for rule in &am.inhibit_rules {
            if let Some(name) = rule.equal.iter().find(|n| !crate::alert::is_valid_label_name(n)) {
                return Err(ConfigError::Validation(format!(
                    "invalid label name {:?} in inhibit rule",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn validate_route(
    route: &RouteConfig,
    inherited: &str,
    receivers: &HashSet<&str>,
) -> Result<(), ConfigError> {
    let receiver = route.receiver.as_deref().unwrap_or(inherited);
    if !receivers.contains(receiver) {
        return Err(ConfigError::Validation(format!(
            "route references undefined receiver {:?}",
            receiver
        )));
    }
    for child in &route.routes {
        validate_route(child, receiver, receivers)?;
    }
    Ok(())
}

/// Parse durations such as `30s`, `5m`, `1h30m`, `2d`, `500ms` or a bare
/// number of seconds
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration {:?}", s));
        }
        let value: u64 = rest[..digits].parse().map_err(|_| format!("invalid duration {:?}", s))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let millis_per_unit: u64 = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, s)),
        };
        rest = &rest[unit_len..];
        total = total
            .checked_add(Duration::from_millis(value.saturating_mul(millis_per_unit)))
            .ok_or_else(|| format!("duration {:?} is out of range", s))?;
    }
    Ok(total)
}

/// Render a duration in the largest exact unit
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    const UNITS: [(&str, u128); 5] = [
        ("w", 604_800_000),
        ("d", 86_400_000),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
    ];
    for (unit, size) in UNITS {
        if millis >= size && millis % size == 0 {
            return format!("{}{}", millis / size, unit);
        }
    }
    format!("{}ms", millis)
}

mod duration {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => super::parse_duration(&s).map_err(D::Error::custom),
            Value::Number(n) => n
                .as_u64()
                .map(Duration::from_secs)
                .ok_or_else(|| D::Error::custom(format!("invalid duration {}", n))),
            other => Err(D::Error::custom(format!("invalid duration {}", other))),
        }
    }
}

mod duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Wrapper(#[serde(with = "super::duration")] Duration);

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => super::duration::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(d)| d))
    }
}
