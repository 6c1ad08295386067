//! Engine Instance
//!
//! Everything built from one configuration snapshot: route tree, receivers,
//! inhibition rules, silences and the alert provider, plus the dispatcher
//! task that drives delivery. Instances are never reconfigured in place; a
//! new configuration means a new instance.

use crate::alert::Alert;
use crate::config::UserConfig;
use crate::dispatch::Dispatcher;
use crate::inhibit::Inhibitor;
use crate::matcher::Matcher;
use crate::nflog::NotificationLog;
use crate::provider::{AlertProvider, MemAlertProvider};
use crate::receiver::{IntegrationRegistry, Receiver};
use crate::route::Route;
use crate::silence::Silences;
use crate::{AlertError, BuildError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of an engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// No instance exists yet
    Uninitialized,
    /// Assembled but not yet accepting alerts
    Building,
    /// Accepting alerts and dispatching
    Live,
    /// Superseded; flushing and stopping background work
    Retiring,
    /// Terminal
    Stopped,
}

impl InstanceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => InstanceState::Building,
            2 => InstanceState::Live,
            3 => InstanceState::Retiring,
            4 => InstanceState::Stopped,
            _ => InstanceState::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            InstanceState::Uninitialized => 0,
            InstanceState::Building => 1,
            InstanceState::Live => 2,
            InstanceState::Retiring => 3,
            InstanceState::Stopped => 4,
        }
    }
}

pub struct EngineInstance {
    id: Uuid,
    config: Arc<UserConfig>,
    data_dir: PathBuf,
    resolve_timeout: chrono::Duration,
    route: Arc<Route>,
    receivers: Arc<HashMap<String, Receiver>>,
    silences: Arc<RwLock<Silences>>,
    nflog: Arc<Mutex<NotificationLog>>,
    provider: Arc<MemAlertProvider>,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EngineInstance {
    /// Assemble an instance from `config`. Nothing is spawned until [`start`].
    ///
    /// [`start`]: EngineInstance::start
    pub fn build(
        config: Arc<UserConfig>,
        data_dir: &Path,
        registry: &IntegrationRegistry,
    ) -> Result<Self, BuildError> {
        config.validate()?;
        let am = &config.alertmanager_config;

        let route = Route::compile(&am.route);
        let receivers = am
            .receivers
            .iter()
            .map(|r| Ok((r.name.clone(), Receiver::build(r, registry)?)))
            .collect::<Result<HashMap<_, _>, BuildError>>()?;

        let silences = Silences::load(data_dir)?;
        let nflog = NotificationLog::load(data_dir)?;

        let resolve_timeout = chrono::Duration::from_std(am.global.resolve_timeout)
            .unwrap_or(crate::normalizer::DEFAULT_RESOLVE_TIMEOUT);

        let mut routes = 0;
        route.walk(&mut |_| routes += 1);

        let id = Uuid::new_v4();
        debug!(
            "Built engine instance {} ({} routes, {} receivers, {} inhibit rules)",
            id,
            routes,
            receivers.len(),
            am.inhibit_rules.len()
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            id,
            data_dir: data_dir.to_path_buf(),
            resolve_timeout,
            route: Arc::new(route),
            receivers: Arc::new(receivers),
            silences: Arc::new(RwLock::new(silences)),
            nflog: Arc::new(Mutex::new(nflog)),
            provider: Arc::new(MemAlertProvider::new()),
            state: AtomicU8::new(InstanceState::Building.as_u8()),
            shutdown,
            task: Mutex::new(None),
            config,
        })
    }

    /// Spawn the dispatcher and go live. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<(), AlertError> {
        self.transition(InstanceState::Building, InstanceState::Live)?;

        let dispatcher = Dispatcher::new(
            self.route.clone(),
            self.receivers.clone(),
            Inhibitor::new(&self.config.alertmanager_config.inhibit_rules),
            self.silences.clone(),
            self.nflog.clone(),
            self.provider.clone(),
        );
        let handle = tokio::spawn(dispatcher.run(self.shutdown.subscribe()));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }

        info!("Engine instance {} is live", self.id);
        Ok(())
    }

    /// Stop accepting alerts, flush pending groups and persist state.
    /// Safe to call more than once.
    pub async fn stop(&self) -> std::io::Result<()> {
        let previous = self.state.swap(InstanceState::Retiring.as_u8(), Ordering::SeqCst);
        match InstanceState::from_u8(previous) {
            InstanceState::Retiring | InstanceState::Stopped => {
                self.state.store(previous, Ordering::SeqCst);
                return Ok(());
            }
            _ => {}
        }
        debug!("Engine instance {} retiring", self.id);

        let _ = self.shutdown.send(true);
        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Dispatcher of instance {} ended abnormally: {}", self.id, e);
            }
        }

        let result = self.persist().await;
        self.state.store(InstanceState::Stopped.as_u8(), Ordering::SeqCst);
        info!("Engine instance {} stopped", self.id);
        result
    }

    async fn persist(&self) -> std::io::Result<()> {
        let silences = self
            .silences
            .read()
            .map(|s| s.clone())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        silences.snapshot(&self.data_dir).await?;

        let nflog = self
            .nflog
            .lock()
            .map(|l| l.clone())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        nflog.snapshot(&self.data_dir).await
    }

    fn transition(&self, from: InstanceState, to: InstanceState) -> Result<(), AlertError> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| AlertError::NotLive(format!("{:?}", InstanceState::from_u8(actual))))
    }

    /// Hand a normalized batch to the provider
    pub fn put_alerts(&self, alerts: Vec<Alert>) -> Result<(), AlertError> {
        let state = self.state();
        if state != InstanceState::Live {
            return Err(AlertError::NotLive(format!("{:?}", state)));
        }
        self.provider.put(alerts)
    }

    /// Add a silence to this instance
    pub fn add_silence(
        &self,
        matchers: Vec<Matcher>,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        created_by: &str,
        comment: &str,
    ) -> Result<Uuid, AlertError> {
        self.silences
            .write()
            .map_err(|e| AlertError::Provider(format!("Lock error: {}", e)))?
            .add(matchers, starts_at, ends_at, created_by, comment)
    }

    pub fn expire_silence(&self, id: Uuid) -> Result<(), AlertError> {
        self.silences
            .write()
            .map_err(|e| AlertError::Provider(format!("Lock error: {}", e)))?
            .expire(id, Utc::now())
    }

    /// Copy of the current silence set
    pub fn silences_snapshot(&self) -> Silences {
        self.silences.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Replace the silence set with the one of the instance being replaced
    pub fn replace_silences(&self, silences: Silences) {
        if let Ok(mut current) = self.silences.write() {
            *current = silences;
        }
    }

    /// Fold in silences from another instance, see [`Silences::merge`]
    pub fn merge_silences(&self, silences: Silences) {
        if let Ok(mut current) = self.silences.write() {
            current.merge(silences);
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Arc<UserConfig> {
        &self.config
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn resolve_timeout(&self) -> chrono::Duration {
        self.resolve_timeout
    }

    pub fn provider(&self) -> Arc<MemAlertProvider> {
        self.provider.clone()
    }

    pub fn receiver_names(&self) -> Vec<&str> {
        self.receivers.keys().map(String::as_str).collect()
    }

    /// Deliveries made by this instance so far
    pub fn notifications_sent(&self) -> u64 {
        self.nflog.lock().map(|l| l.sent()).unwrap_or(0)
    }
}

impl Drop for EngineInstance {
    fn drop(&mut self) {
        // Never leave a dispatcher running behind a dropped instance.
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LabelSet;

    const CONFIG: &str = r#"{"alertmanager_config": {
        "global": { "resolve_timeout": "2m" },
        "route": { "receiver": "ops", "group_wait": "1h" },
        "receivers": [{ "name": "ops", "grafana_managed_receiver_configs": [
            { "name": "ops hook", "type": "webhook", "settings": { "url": "http://hook" } }
        ]}]
    }}"#;

    fn config(raw: &str) -> Arc<UserConfig> {
        Arc::new(UserConfig::parse(raw).unwrap())
    }

    fn alert(name: &str) -> Alert {
        let now = Utc::now();
        let mut labels = LabelSet::new();
        labels.insert("alertname".into(), name.into());
        Alert {
            labels,
            annotations: LabelSet::new(),
            starts_at: now,
            ends_at: now + chrono::Duration::minutes(5),
            generator_url: String::new(),
            updated_at: now,
            timeout: true,
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = IntegrationRegistry::default();
        let instance = EngineInstance::build(config(CONFIG), dir.path(), &registry).unwrap();
        assert_eq!(instance.state(), InstanceState::Building);
        assert_eq!(instance.resolve_timeout(), chrono::Duration::minutes(2));
        assert!(matches!(instance.put_alerts(vec![alert("A")]), Err(AlertError::NotLive(_))));

        instance.start().unwrap();
        assert_eq!(instance.state(), InstanceState::Live);
        assert!(instance.start().is_err());
        instance.put_alerts(vec![alert("A")]).unwrap();

        instance.stop().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);
        assert!(matches!(instance.put_alerts(vec![alert("B")]), Err(AlertError::NotLive(_))));
        instance.stop().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_flushes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let registry = IntegrationRegistry::default();
        let instance = EngineInstance::build(config(CONFIG), dir.path(), &registry).unwrap();
        instance.start().unwrap();
        let until = Utc::now() + chrono::Duration::hours(1);
        instance
            .add_silence(vec!["alertname=Quiet".parse().unwrap()], Utc::now(), until, "ops", "")
            .unwrap();
        let expired = instance
            .add_silence(vec!["alertname=Loud".parse().unwrap()], Utc::now(), until, "ops", "")
            .unwrap();
        instance.expire_silence(expired).unwrap();
        assert!(instance.expire_silence(Uuid::new_v4()).is_err());
        instance.put_alerts(vec![alert("Loud")]).unwrap();

        // group_wait is an hour; only the shutdown flush can deliver.
        instance.stop().await.unwrap();
        assert_eq!(instance.notifications_sent(), 1);
        assert!(dir.path().join(crate::silence::SILENCES_FILE).exists());
        assert!(dir.path().join(crate::nflog::NFLOG_FILE).exists());

        let next = EngineInstance::build(config(CONFIG), dir.path(), &registry).unwrap();
        assert_eq!(next.silences_snapshot().len(), 2);
    }

    #[test]
    fn test_silences_added_during_swap_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let registry = IntegrationRegistry::default();
        let old = EngineInstance::build(config(CONFIG), dir.path(), &registry).unwrap();
        let new = EngineInstance::build(config(CONFIG), dir.path(), &registry).unwrap();
        let until = Utc::now() + chrono::Duration::hours(1);

        old.add_silence(vec!["alertname=A".parse().unwrap()], Utc::now(), until, "ops", "")
            .unwrap();
        new.replace_silences(old.silences_snapshot());

        // Still reachable through a stale handle after the copy
        old.add_silence(vec!["alertname=B".parse().unwrap()], Utc::now(), until, "ops", "")
            .unwrap();
        new.merge_silences(old.silences_snapshot());
        new.merge_silences(old.silences_snapshot());

        assert_eq!(new.silences_snapshot().len(), 2);
    }

    #[test]
    fn test_receiver_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let raw = r#"{"alertmanager_config": {
            "route": { "receiver": "ops" },
            "receivers": [{ "name": "ops", "grafana_managed_receiver_configs": [
                { "name": "broken", "type": "email", "settings": {} }
            ]}]
        }}"#;
        let registry = IntegrationRegistry::default();
        let result = EngineInstance::build(config(raw), dir.path(), &registry);
        assert!(matches!(result, Err(BuildError::Receiver(_))));
    }

    #[test]
    fn test_each_build_has_new_identity() {
        let dir = tempfile::tempdir().unwrap();
        let registry = IntegrationRegistry::default();
        let a = EngineInstance::build(config(CONFIG), dir.path(), &registry).unwrap();
        let b = EngineInstance::build(config(CONFIG), dir.path(), &registry).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.receiver_names(), vec!["ops"]);
    }
}
