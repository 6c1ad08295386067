//! Receivers and the Integration Registry
//!
//! A receiver is a named list of integrations. Integrations are built from
//! their configuration by a constructor looked up by type tag in an
//! [`IntegrationRegistry`] assembled once at startup. Tags without a
//! registered constructor fall back to [`LogNotifier`].

use crate::alert::Alert;
use crate::config::{IntegrationConfig, ReceiverConfig};
use crate::BuildError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Delivery failure of a single integration
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Integration {0} is not available")]
    Unavailable(String),
}

/// Delivers a group of alerts to one destination
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alerts: &[Alert]) -> Result<(), NotifyError>;
}

/// Constructor for one integration type
pub type IntegrationFactory = fn(&IntegrationConfig) -> Result<Arc<dyn Notifier>, BuildError>;

/// Notifier that records deliveries through `tracing`
pub struct LogNotifier {
    kind: String,
    name: String,
}

impl LogNotifier {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alerts: &[Alert]) -> Result<(), NotifyError> {
        let names: Vec<&str> = alerts.iter().map(Alert::name).collect();
        info!(
            integration = %self.kind,
            name = %self.name,
            count = alerts.len(),
            "Notifying {:?}",
            names
        );
        Ok(())
    }
}

fn require_setting<'a>(config: &'a IntegrationConfig, key: &str) -> Result<&'a str, BuildError> {
    config.setting_str(key).ok_or_else(|| {
        BuildError::Receiver(format!(
            "{} integration {:?}: missing required setting {:?}",
            config.kind, config.name, key
        ))
    })
}

fn build_email(config: &IntegrationConfig) -> Result<Arc<dyn Notifier>, BuildError> {
    let addresses = require_setting(config, "addresses")?;
    if !addresses.split([',', ';', '\n']).map(str::trim).any(|a| a.contains('@')) {
        return Err(BuildError::Receiver(format!(
            "email integration {:?}: no valid address in {:?}",
            config.name, addresses
        )));
    }
    Ok(Arc::new(LogNotifier::new("email", config.name.clone())))
}

fn build_webhook(config: &IntegrationConfig) -> Result<Arc<dyn Notifier>, BuildError> {
    let url = require_setting(config, "url")?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(BuildError::Receiver(format!(
            "webhook integration {:?}: url {:?} is not http(s)",
            config.name, url
        )));
    }
    Ok(Arc::new(LogNotifier::new("webhook", config.name.clone())))
}

fn build_slack(config: &IntegrationConfig) -> Result<Arc<dyn Notifier>, BuildError> {
    if config.setting_str("url").is_none() && config.setting_str("recipient").is_none() {
        return Err(BuildError::Receiver(format!(
            "slack integration {:?}: either url or recipient must be set",
            config.name
        )));
    }
    Ok(Arc::new(LogNotifier::new("slack", config.name.clone())))
}

/// Map from integration type tag to constructor
#[derive(Clone)]
pub struct IntegrationRegistry {
    factories: HashMap<String, IntegrationFactory>,
}

impl IntegrationRegistry {
    /// Empty registry; every tag falls back to [`LogNotifier`]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) the constructor for `kind`
    pub fn register(&mut self, kind: impl Into<String>, factory: IntegrationFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Build one integration
    pub fn build(&self, config: &IntegrationConfig) -> Result<Arc<dyn Notifier>, BuildError> {
        match self.factories.get(config.kind.as_str()) {
            Some(factory) => factory(config),
            None => {
                warn!(
                    "No integration registered for type {:?}, falling back to log notifier",
                    config.kind
                );
                Ok(Arc::new(LogNotifier::new(config.kind.clone(), config.name.clone())))
            }
        }
    }
}

impl Default for IntegrationRegistry {
    /// Registry with the built-in email, webhook and slack constructors
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("email", build_email);
        registry.register("webhook", build_webhook);
        registry.register("slack", build_slack);
        registry
    }
}

/// A built integration plus its delivery options
pub struct Integration {
    pub kind: String,
    pub name: String,
    pub send_resolved: bool,
    notifier: Arc<dyn Notifier>,
}

impl Integration {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        send_resolved: bool,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            send_resolved,
            notifier,
        }
    }

    /// Deliver `alerts`, leaving out resolved ones when resolve messages are off
    pub async fn notify(&self, alerts: &[Alert], now: DateTime<Utc>) -> Result<(), NotifyError> {
        if self.send_resolved {
            return self.notifier.notify(alerts).await;
        }
        let firing: Vec<Alert> = alerts.iter().filter(|a| !a.resolved_at(now)).cloned().collect();
        if firing.is_empty() {
            return Ok(());
        }
        self.notifier.notify(&firing).await
    }
}

/// Named notification destination
pub struct Receiver {
    pub name: String,
    pub integrations: Vec<Integration>,
}

impl Receiver {
    pub fn build(
        config: &ReceiverConfig,
        registry: &IntegrationRegistry,
    ) -> Result<Self, BuildError> {
        let integrations = config
            .grafana_managed_receiver_configs
            .iter()
            .map(|c| {
                let notifier = registry.build(c)?;
                let send_resolved = !c.disable_resolve_message;
                Ok(Integration::new(c.kind.clone(), c.name.clone(), send_resolved, notifier))
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        Ok(Self {
            name: config.name.clone(),
            integrations,
        })
    }

    /// Fan out to every integration; returns the number of failures
    pub async fn notify(&self, alerts: &[Alert], now: DateTime<Utc>) -> usize {
        let mut failures = 0;
        for integration in &self.integrations {
            match integration.notify(alerts, now).await {
                Ok(()) => {
                    metrics::counter!(
                        "alertmanager_notifications_total",
                        "integration" => integration.kind.clone()
                    )
                    .increment(1);
                }
                Err(e) => {
                    failures += 1;
                    metrics::counter!(
                        "alertmanager_notifications_failed_total",
                        "integration" => integration.kind.clone()
                    )
                    .increment(1);
                    warn!(
                        receiver = %self.name,
                        integration = %integration.kind,
                        "Notification failed: {}",
                        e
                    );
                }
            }
        }
        failures
    }
}
