//! Shared services of a running pipeline
//!
//! A [`RootsContext`] owns everything detectors and diagnosis services share: the
//! anomaly bus, the data store registry, the statistical engine pool, the global
//! properties, metrics and health. It is passed explicitly to whatever needs it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::anomaly::{AnomalyBus, AnomalyDetector, DetectorConfig};
use crate::bottleneck::BottleneckFinderService;
use crate::config::Properties;
use crate::error::Result;
use crate::health::{components, HealthRegistry};
use crate::observability::RootsMetrics;
use crate::scheduler::ScheduledItem;
use crate::stats::{StatsEngine, StatsEngineConfig};
use crate::store::{DataStore, DataStoreRegistry};
use crate::workload::WorkloadAnalyzerService;

pub struct RootsContext {
    properties: Properties,
    stores: Arc<DataStoreRegistry>,
    stats: Arc<StatsEngine>,
    bus: AnomalyBus,
    metrics: RootsMetrics,
    health: HealthRegistry,
}

impl RootsContext {
    pub fn new(
        properties: Properties,
        stats: StatsEngineConfig,
        store_timeout: Duration,
        health: HealthRegistry,
    ) -> Self {
        Self::with_engine(properties, StatsEngine::local(stats), store_timeout, health)
    }

    /// Build a context around an already configured statistical engine
    pub fn with_engine(
        properties: Properties,
        engine: StatsEngine,
        store_timeout: Duration,
        health: HealthRegistry,
    ) -> Self {
        Self {
            properties,
            stores: Arc::new(DataStoreRegistry::new(store_timeout)),
            stats: Arc::new(engine),
            bus: AnomalyBus::new(),
            metrics: RootsMetrics::new(),
            health,
        }
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn stores(&self) -> &Arc<DataStoreRegistry> {
        &self.stores
    }

    pub fn stats(&self) -> &Arc<StatsEngine> {
        &self.stats
    }

    pub fn bus(&self) -> &AnomalyBus {
        &self.bus
    }

    pub fn metrics(&self) -> &RootsMetrics {
        &self.metrics
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Register the shared components with the health registry
    pub async fn init(&self) {
        for component in [components::ANOMALY_BUS, components::STATS_ENGINE] {
            self.health.register(component).await;
            self.health.set_healthy(component).await;
        }
        info!(
            data_stores = self.stores.len(),
            pool_size = self.stats.available(),
            "Roots context initialized"
        );
    }

    pub fn register_data_store(&self, name: impl Into<String>, store: Arc<dyn DataStore>) {
        self.stores.register(name, store);
    }

    /// Subscribe the bottleneck finder and workload analyzer to the bus
    ///
    /// Invalid global properties fail here, before anything is subscribed.
    pub async fn subscribe_default_services(&self) -> Result<()> {
        let bottleneck =
            BottleneckFinderService::new(self.stores.clone(), self.stats.clone(), self.properties.clone())?;
        let workload =
            WorkloadAnalyzerService::new(self.stores.clone(), self.stats.clone(), &self.properties)?;
        self.bus.subscribe(Arc::new(bottleneck)).await;
        self.bus.subscribe(Arc::new(workload)).await;
        Ok(())
    }

    /// Build a detector that publishes to this context's bus
    pub fn build_detector(&self, config: &DetectorConfig) -> Result<Arc<dyn ScheduledItem>> {
        let detector = AnomalyDetector::from_config(config, &self.stores, self.bus.clone())?;
        Ok(detector.into_scheduled())
    }

    /// Build every configured detector; the first invalid definition fails the set
    pub fn build_detectors(&self, configs: &[DetectorConfig]) -> Result<Vec<Arc<dyn ScheduledItem>>> {
        configs.iter().map(|c| self.build_detector(c)).collect()
    }

    /// Release shared resources; detectors must already be stopped
    pub async fn shutdown(&self) {
        self.bus.clear().await;
        self.stats.close();
        self.stores.clear();
        self.health
            .set_unhealthy(components::STATS_ENGINE, "Statistical engine closed")
            .await;
        self.health
            .set_unhealthy(components::ANOMALY_BUS, "Anomaly bus closed")
            .await;
        warn!("Roots context shut down");
    }
}
