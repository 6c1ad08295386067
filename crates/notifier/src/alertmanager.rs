//! Alertmanager Facade
//!
//! Owns the current configuration snapshot and the live engine instance.
//! Ingestion takes the shared lock; a reconfiguration builds the new instance
//! without any lock held and only takes the exclusive lock to swap it in.

use crate::default_config::default_configuration;
use crate::error::AlertmanagerError;
use crate::settings::Settings;
use alerting::receiver::IntegrationRegistry;
use alerting::{
    normalize_batch, Alert, AlertProvider, EngineInstance, InstanceState, PostableAlerts,
    UserConfig,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex as StdMutex};
use storage::{ConfigStore, SaveConfigCmd};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Version tag written with every saved configuration revision
pub const CONFIGURATION_VERSION: &str = "v1";

#[derive(Default)]
struct ActiveState {
    config: Option<Arc<UserConfig>>,
    instance: Option<Arc<EngineInstance>>,
}

pub struct Alertmanager {
    settings: Settings,
    store: Arc<dyn ConfigStore>,
    registry: IntegrationRegistry,
    state: RwLock<ActiveState>,
    /// Serializes reconfigurations
    sync_lock: Mutex<()>,
    /// Last ingestion timestamp handed out
    last_ingestion: StdMutex<DateTime<Utc>>,
}

impl Alertmanager {
    /// Create a facade with the built-in integration registry
    pub fn new(settings: Settings, store: Arc<dyn ConfigStore>) -> Self {
        Self::with_registry(settings, store, IntegrationRegistry::default())
    }

    pub fn with_registry(
        settings: Settings,
        store: Arc<dyn ConfigStore>,
        registry: IntegrationRegistry,
    ) -> Self {
        Self {
            settings,
            store,
            registry,
            state: RwLock::new(ActiveState::default()),
            sync_lock: Mutex::new(()),
            last_ingestion: StdMutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Prepare the data directory and bring up an engine instance from the
    /// resident configuration, or the default one if none is loaded.
    pub async fn init(&self) -> Result<(), AlertmanagerError> {
        let _guard = self.sync_lock.lock().await;

        let resident = self.state.read().await.config.clone();
        let config = match resident {
            Some(config) => config,
            None => Arc::new(UserConfig::parse(default_configuration())?),
        };

        info!("Initializing alertmanager in {}", self.settings.alerting_dir().display());
        self.install(config).await
    }

    /// Fetch the latest stored configuration and apply it if it changed.
    ///
    /// A missing configuration means the default one. Any failure leaves the
    /// previous instance serving.
    pub async fn sync_and_apply_config_from_database(&self) -> Result<(), AlertmanagerError> {
        let _guard = self.sync_lock.lock().await;
        metrics::counter!("alertmanager_config_syncs_total").increment(1);

        let stored = self
            .store
            .get_latest_config(self.settings.org_id)
            .await
            .map_err(|e| {
                error!("Failed to fetch configuration for org {}: {}", self.settings.org_id, e);
                AlertmanagerError::Retrieval(e)
            })?;

        let config = match stored {
            Some(stored) => {
                debug!(
                    "Loaded configuration revision {} (version {})",
                    stored.id, stored.configuration_version
                );
                UserConfig::parse(&stored.configuration)
            }
            None => {
                debug!("No configuration stored for org {}, using default", self.settings.org_id);
                UserConfig::parse(default_configuration())
            }
        }
        .map_err(|e| {
            error!("Stored configuration is invalid: {}", e);
            AlertmanagerError::InvalidConfig(e)
        })?;

        self.apply(config).await
    }

    /// Persist `config` as the org's latest revision and apply it
    pub async fn save_and_apply_config(&self, config: UserConfig) -> Result<(), AlertmanagerError> {
        let _guard = self.sync_lock.lock().await;

        config.validate()?;
        let raw = config.to_json()?;
        self.store
            .save_config(self.settings.org_id, SaveConfigCmd::new(raw, CONFIGURATION_VERSION))
            .await
            .map_err(AlertmanagerError::Store)?;

        self.apply(config).await
    }

    /// Normalize a batch and hand it to the live instance in one call
    pub async fn put_alerts(&self, alerts: PostableAlerts) -> Result<(), AlertmanagerError> {
        // Held until the provider has the batch, so a concurrent swap cannot
        // retire the instance in between.
        let state = self.state.read().await;
        let instance = state.instance.as_ref().ok_or(AlertmanagerError::NotInitialized)?;

        let now = self.ingestion_time();
        let alerts = normalize_batch(alerts.alerts, now, instance.resolve_timeout());
        let count = alerts.len() as u64;

        instance.put_alerts(alerts).map_err(|e| {
            warn!("Alert batch rejected: {}", e);
            AlertmanagerError::Ingestion(e)
        })?;

        metrics::counter!("alertmanager_alerts_received_total").increment(count);
        debug!("Accepted {} alerts into instance {}", count, instance.id());
        Ok(())
    }

    /// Retire the live instance (service shutdown)
    pub async fn stop(&self) {
        let _guard = self.sync_lock.lock().await;
        let old = self.state.write().await.instance.take();
        if let Some(old) = old {
            self.retire(old).await;
        }
    }

    /// Currently active configuration
    pub async fn config(&self) -> Option<Arc<UserConfig>> {
        self.state.read().await.config.clone()
    }

    /// Identity of the live engine instance
    pub async fn instance_id(&self) -> Option<Uuid> {
        self.state.read().await.instance.as_ref().map(|i| i.id())
    }

    /// Live engine instance, e.g. for silence management
    pub async fn instance(&self) -> Option<Arc<EngineInstance>> {
        self.state.read().await.instance.clone()
    }

    pub async fn engine_state(&self) -> InstanceState {
        self.state
            .read()
            .await
            .instance
            .as_ref()
            .map(|i| i.state())
            .unwrap_or(InstanceState::Uninitialized)
    }

    /// Snapshot of the alerts held by the live instance
    pub async fn get_alerts(&self) -> Vec<Alert> {
        self.state
            .read()
            .await
            .instance
            .as_ref()
            .map(|i| i.provider().get_pending())
            .unwrap_or_default()
    }

    /// Apply `config` unless it equals the active one. Caller holds `sync_lock`.
    async fn apply(&self, config: UserConfig) -> Result<(), AlertmanagerError> {
        {
            let state = self.state.read().await;
            if state.instance.is_some() && state.config.as_deref() == Some(&config) {
                debug!("Configuration unchanged, keeping current instance");
                return Ok(());
            }
        }
        self.install(Arc::new(config)).await
    }

    /// Build, start and swap in a new instance. Caller holds `sync_lock`.
    async fn install(&self, config: Arc<UserConfig>) -> Result<(), AlertmanagerError> {
        let dir = self.settings.alerting_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let instance = EngineInstance::build(config.clone(), &dir, &self.registry).map_err(|e| {
            error!("Failed to build engine instance: {}", e);
            AlertmanagerError::Build(e)
        })?;

        let instance = Arc::new(instance);
        instance.start()?;

        let old = {
            let mut state = self.state.write().await;
            if let Some(previous) = &state.instance {
                instance.replace_silences(previous.silences_snapshot());
            }
            state.config = Some(config);
            state.instance.replace(instance.clone())
        };

        metrics::counter!("alertmanager_config_applies_total").increment(1);
        info!("Applied new configuration, instance {} is live", instance.id());

        if let Some(old) = old {
            self.retire(old.clone()).await;
            // Pick up silences added through a handle to the old instance
            // while the swap was in flight.
            instance.merge_silences(old.silences_snapshot());
        }
        Ok(())
    }

    async fn retire(&self, instance: Arc<EngineInstance>) {
        if let Err(e) = instance.stop().await {
            warn!("Failed to persist state of retired instance {}: {}", instance.id(), e);
        }
    }

    /// Wall-clock time for a batch, never earlier than the previous batch's
    fn ingestion_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_ingestion.lock() {
            Ok(mut last) => {
                let now = now.max(*last);
                *last = now;
                now
            }
            Err(_) => now,
        }
    }
}
