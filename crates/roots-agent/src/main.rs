//! Roots agent - SLO anomaly detection and diagnosis
//!
//! Runs the configured detectors on a schedule, diagnoses every anomaly they raise
//! and exposes health and metrics over HTTP.

use std::sync::Arc;

use anyhow::{Context, Result};
use roots_agent::{api, config::AgentConfig};
use roots_lib::store::InMemoryDataStore;
use roots_lib::{HealthRegistry, RootsContext, SchedulerService};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = AGENT_VERSION, "Starting roots-agent");

    let config = AgentConfig::load()?;
    info!(
        detectors = config.detectors.len(),
        data_stores = config.data_stores.len(),
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    let context = RootsContext::new(
        config.properties.clone(),
        config.stats_config(),
        config.store_timeout(),
        health_registry.clone(),
    );
    context.init().await;

    if config.data_stores.is_empty() {
        warn!("No data stores configured, registering an empty in-memory store as default");
        context.register_data_store("default", Arc::new(InMemoryDataStore::new()));
    }
    for store in &config.data_stores {
        let data_store = match &store.snapshot {
            Some(path) => InMemoryDataStore::from_json_file(path)
                .await
                .with_context(|| format!("failed to load data store {}", store.name))?,
            None => InMemoryDataStore::new(),
        };
        context.register_data_store(store.name.clone(), Arc::new(data_store));
    }

    context.subscribe_default_services().await?;
    let detectors = context.build_detectors(&config.detectors)?;

    let scheduler = SchedulerService::new(config.scheduler_config(), health_registry.clone());
    let scheduled = scheduler.start(detectors).await;
    info!(scheduled, "Detectors scheduled");

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        context.metrics().clone(),
    ));
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    health_registry.set_ready(false).await;

    scheduler.stop().await;
    context.shutdown().await;
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}
