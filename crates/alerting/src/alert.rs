//! Alert Data Model

use crate::AlertError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label or annotation set, ordered by name
pub type LabelSet = BTreeMap<String, String>;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const SEPARATOR: u8 = 0xff;

/// Deterministic identifier of a label set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// FNV-1a over sorted `name 0xff value 0xff` pairs
    pub fn from_labels(labels: &LabelSet) -> Self {
        let mut hash = FNV_OFFSET;
        let mut feed = |bytes: &[u8]| {
            for b in bytes {
                hash ^= u64::from(*b);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        };
        for (name, value) in labels {
            feed(name.as_bytes());
            feed(&[SEPARATOR]);
            feed(value.as_bytes());
            feed(&[SEPARATOR]);
        }
        Fingerprint(hash)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Check a label name against `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Canonical alert handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub labels: LabelSet,
    pub annotations: LabelSet,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    /// Set by the system at ingestion
    pub updated_at: DateTime<Utc>,
    /// True when `ends_at` was assigned by the resolve-timeout policy
    pub timeout: bool,
}

impl Alert {
    /// Fingerprint of the alert's labels
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_labels(&self.labels)
    }

    /// Alert name label, if present
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map(String::as_str).unwrap_or("")
    }

    /// Whether the alert has ended as of `now`
    pub fn resolved_at(&self, now: DateTime<Utc>) -> bool {
        self.ends_at <= now
    }

    /// Validate labels, annotations and the activity range
    pub fn validate(&self) -> Result<(), AlertError> {
        if self.labels.is_empty() {
            return Err(AlertError::InvalidLabels("at least one label pair required".to_string()));
        }
        for (name, value) in &self.labels {
            if !is_valid_label_name(name) {
                return Err(AlertError::InvalidLabels(format!("invalid label name {:?}", name)));
            }
            if value.is_empty() {
                return Err(AlertError::InvalidLabels(format!("empty value for label {:?}", name)));
            }
        }
        for name in self.annotations.keys() {
            if !is_valid_label_name(name) {
                return Err(AlertError::InvalidLabels(format!(
                    "invalid annotation name {:?}",
                    name
                )));
            }
        }
        if self.ends_at < self.starts_at {
            return Err(AlertError::InvalidTimes {
                starts_at: self.starts_at,
                ends_at: self.ends_at,
            });
        }
        Ok(())
    }

    /// Merge two updates of the same alert. The one with the later
    /// `updated_at` provides the payload; the earliest start is kept.
    pub fn merge(&self, other: &Alert, now: DateTime<Utc>) -> Alert {
        if other.updated_at < self.updated_at {
            return other.merge(self, now);
        }

        let mut merged = other.clone();
        if self.starts_at < other.starts_at {
            merged.starts_at = self.starts_at;
        }

        if other.resolved_at(now) {
            // Latest explicit resolution wins when both are resolved.
            if self.resolved_at(now) && self.ends_at > other.ends_at {
                merged.ends_at = self.ends_at;
            }
        } else if self.ends_at > other.ends_at && !self.timeout {
            merged.ends_at = self.ends_at;
            merged.timeout = false;
        }
        merged
    }
}

/// Alert as submitted by a client; temporal fields are optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableAlert {
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub annotations: LabelSet,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
}

/// A batch of postable alerts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostableAlerts {
    pub alerts: Vec<PostableAlert>,
}

impl From<Vec<PostableAlert>> for PostableAlerts {
    fn from(alerts: Vec<PostableAlert>) -> Self {
        Self { alerts }
    }
}
