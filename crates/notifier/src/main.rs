//! Alert Pipeline - Main Entry Point

use anyhow::Context;
use notifier::{telemetry, Alertmanager, Settings};
use std::sync::Arc;
use storage::SqliteConfigStore;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;
    telemetry::init_logging(&settings.log_level, settings.log_json)
        .map_err(|e| anyhow::anyhow!("initializing logging: {}", e))?;

    info!("=== Alert Pipeline v{} ===", env!("CARGO_PKG_VERSION"));

    if let Some(addr) = &settings.metrics_addr {
        telemetry::init_metrics(addr).map_err(|e| anyhow::anyhow!("initializing metrics: {}", e))?;
    }

    tokio::fs::create_dir_all(&settings.data_path)
        .await
        .with_context(|| format!("creating {}", settings.data_path.display()))?;
    let store = Arc::new(
        SqliteConfigStore::connect(&settings.database_url)
            .await
            .context("opening configuration store")?,
    );

    let interval = settings.sync_interval();
    let alertmanager = Alertmanager::new(settings, store.clone());
    alertmanager.init().await.context("initializing alertmanager")?;
    if let Err(e) = alertmanager.sync_and_apply_config_from_database().await {
        error!("Initial configuration sync failed: {}", e);
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    info!("Syncing configuration every {:?}", interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = alertmanager.sync_and_apply_config_from_database().await {
                    error!("Configuration sync failed: {}", e);
                }
            }
        }
    }

    alertmanager.stop().await;
    store.close().await;
    info!("Alert pipeline stopped");
    Ok(())
}
