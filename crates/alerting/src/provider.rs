//! Alert Provider
//!
//! Ingestion sink of an engine instance. Stores the latest state of every
//! alert by fingerprint and fans updates out to subscribers.

use crate::alert::{Alert, Fingerprint};
use crate::AlertError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Per-subscriber buffer of live updates
const SUBSCRIBER_BUFFER: usize = 1024;

/// Contract between the ingestion path and the dispatcher
pub trait AlertProvider: Send + Sync {
    /// Store a batch. Either every alert is accepted or none is.
    fn put(&self, alerts: Vec<Alert>) -> Result<(), AlertError>;

    /// Current state of one alert
    fn get(&self, fingerprint: Fingerprint) -> Result<Alert, AlertError>;

    /// All current alerts followed by every future update
    fn subscribe(&self) -> AlertIterator;

    /// Snapshot of all current alerts
    fn get_pending(&self) -> Vec<Alert>;
}

type AlertMap = HashMap<Fingerprint, Alert>;

/// Stream of alerts handed out by [`AlertProvider::subscribe`].
///
/// A subscriber that falls behind the live channel replays the provider's
/// current state instead of skipping updates.
pub struct AlertIterator {
    initial: VecDeque<Alert>,
    rx: broadcast::Receiver<Alert>,
    alerts: Arc<Mutex<AlertMap>>,
}

impl AlertIterator {
    fn resync(&mut self, skipped: u64) {
        warn!("Alert subscriber lagged by {} updates, replaying current alerts", skipped);
        // Writers insert and send under this lock, so the snapshot and the
        // new receiver line up.
        match self.alerts.lock() {
            Ok(alerts) => {
                self.initial = alerts.values().cloned().collect();
                self.rx = self.rx.resubscribe();
            }
            Err(e) => {
                error!("Alert map lock poisoned during resync: {}", e);
                self.rx = self.rx.resubscribe();
            }
        }
    }

    /// Next alert, or `None` once the provider is gone
    pub async fn next(&mut self) -> Option<Alert> {
        loop {
            if let Some(alert) = self.initial.pop_front() {
                return Some(alert);
            }
            match self.rx.recv().await {
                Ok(alert) => return Some(alert),
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.resync(skipped),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next alert if one is ready without waiting
    pub fn try_next(&mut self) -> Option<Alert> {
        loop {
            if let Some(alert) = self.initial.pop_front() {
                return Some(alert);
            }
            match self.rx.try_recv() {
                Ok(alert) => return Some(alert),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.resync(skipped),
                Err(_) => return None,
            }
        }
    }
}

/// In-memory alert provider
pub struct MemAlertProvider {
    alerts: Arc<Mutex<AlertMap>>,
    tx: broadcast::Sender<Alert>,
}

impl MemAlertProvider {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            alerts: Arc::new(Mutex::new(HashMap::new())),
            tx,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, AlertMap>, AlertError> {
        self.alerts
            .lock()
            .map_err(|e| AlertError::Provider(format!("Lock error: {}", e)))
    }

    /// Drop alerts resolved as of `now`; returns how many were removed
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        match self.lock() {
            Ok(mut alerts) => {
                let before = alerts.len();
                alerts.retain(|_, a| !a.resolved_at(now));
                before - alerts.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemAlertProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Two updates of one alert overlap when either end falls inside the other
fn overlaps(old: &Alert, new: &Alert) -> bool {
    (new.ends_at > old.starts_at && new.ends_at < old.ends_at)
        || (new.starts_at > old.starts_at && new.starts_at < old.ends_at)
}

impl AlertProvider for MemAlertProvider {
    fn put(&self, alerts: Vec<Alert>) -> Result<(), AlertError> {
        if let Some(err) = alerts.iter().find_map(|a| a.validate().err()) {
            metrics::counter!("alertmanager_alerts_invalid_total").increment(alerts.len() as u64);
            return Err(err);
        }

        let now = Utc::now();
        let mut stored = self.lock()?;
        for alert in alerts {
            let fp = alert.fingerprint();
            let alert = match stored.get(&fp) {
                Some(old) if overlaps(old, &alert) => old.merge(&alert, now),
                _ => alert,
            };
            debug!("Stored alert {} ({})", fp, alert.name());
            stored.insert(fp, alert.clone());
            // No subscribers is not an error.
            let _ = self.tx.send(alert);
        }
        Ok(())
    }

    fn get(&self, fingerprint: Fingerprint) -> Result<Alert, AlertError> {
        self.lock()?
            .get(&fingerprint)
            .cloned()
            .ok_or_else(|| AlertError::NotFound(fingerprint.to_string()))
    }

    fn subscribe(&self) -> AlertIterator {
        // Snapshot and receiver are taken under the same lock so that no
        // update is missed or seen twice.
        let guard = self.alerts.lock();
        let initial = match &guard {
            Ok(alerts) => alerts.values().cloned().collect(),
            Err(_) => VecDeque::new(),
        };
        let rx = self.tx.subscribe();
        drop(guard);
        AlertIterator {
            initial,
            rx,
            alerts: self.alerts.clone(),
        }
    }

    fn get_pending(&self) -> Vec<Alert> {
        self.lock()
            .map(|alerts| alerts.values().cloned().collect())
            .unwrap_or_default()
    }
}
