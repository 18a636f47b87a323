//! Anomaly detection and distribution
//!
//! This module provides:
//! - The immutable [`Anomaly`] record and the detector description it carries
//! - SLO-based detection over a rolling window of benchmark samples
//! - The [`AnomalyBus`] delivering anomalies to diagnosis subscribers

mod bus;
mod slo_detector;

#[cfg(test)]
mod tests;

pub use bus::{AnomalyBus, AnomalySubscriber, Delivery};
pub use slo_detector::{RollingWindow, SloBasedDetector, SloDetectorConfig};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Properties;
use crate::error::{Result, RootsError};
use crate::scheduler::ScheduledItem;
use crate::store::DataStoreRegistry;

/// Kind of problem an anomaly reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyType {
    Performance,
    Workload,
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyType::Performance => write!(f, "PERFORMANCE"),
            AnomalyType::Workload => write!(f, "WORKLOAD"),
        }
    }
}

/// Identity and settings of the detector that raised an anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorInfo {
    pub application: String,
    pub data_store: String,
    pub period_in_seconds: u32,
    pub history_length_in_seconds: u32,
    #[serde(default)]
    pub properties: Properties,
}

impl DetectorInfo {
    /// Check the invariants shared by every detector
    pub fn validate(&self) -> Result<()> {
        if self.application.trim().is_empty() {
            return Err(RootsError::config("application name is required"));
        }
        if self.period_in_seconds == 0 {
            return Err(RootsError::config("period must be a positive integer"));
        }
        if self.history_length_in_seconds == 0 {
            return Err(RootsError::config("history length must be a positive integer"));
        }
        if self.history_length_in_seconds % self.period_in_seconds != 0 {
            return Err(RootsError::config(format!(
                "history length {}s must be a multiple of period {}s",
                self.history_length_in_seconds, self.period_in_seconds
            )));
        }
        if self.data_store.trim().is_empty() {
            return Err(RootsError::config("data store name is required"));
        }
        Ok(())
    }

    pub fn period_millis(&self) -> i64 {
        i64::from(self.period_in_seconds) * 1000
    }

    pub fn history_millis(&self) -> i64 {
        i64::from(self.history_length_in_seconds) * 1000
    }
}

/// A detected SLO violation or workload problem
///
/// `start` and `end` are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub id: String,
    pub detector: DetectorInfo,
    pub start: i64,
    pub end: i64,
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub application: String,
    pub operation: String,
    pub description: String,
    pub period_in_seconds: u32,
}

impl Anomaly {
    pub fn new(
        detector: &DetectorInfo,
        start: i64,
        end: i64,
        anomaly_type: AnomalyType,
        operation: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            detector: detector.clone(),
            start,
            end,
            anomaly_type,
            application: detector.application.clone(),
            operation: operation.into(),
            description: description.into(),
            period_in_seconds: detector.period_in_seconds,
        }
    }

    /// Name of the data store the detector reads from
    pub fn data_store(&self) -> &str {
        &self.detector.data_store
    }

    /// Detector-level property, if set
    pub fn detector_property(&self, key: &str) -> Option<&str> {
        self.detector.properties.get(key)
    }
}

/// Detector definition as loaded from configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum DetectorConfig {
    #[serde(rename = "SLOBasedDetector", alias = "slo")]
    Slo(SloDetectorConfig),
}

impl DetectorConfig {
    pub fn application(&self) -> &str {
        match self {
            DetectorConfig::Slo(c) => &c.application,
        }
    }
}

/// Closed set of anomaly detectors
pub enum AnomalyDetector {
    Slo(SloBasedDetector),
}

impl AnomalyDetector {
    /// Build and validate a detector, resolving its data store by name
    pub fn from_config(
        config: &DetectorConfig,
        stores: &DataStoreRegistry,
        bus: AnomalyBus,
    ) -> Result<Self> {
        match config {
            DetectorConfig::Slo(c) => {
                let store = stores.get(&c.data_store)?;
                Ok(AnomalyDetector::Slo(SloBasedDetector::new(c.clone(), store, bus)?))
            }
        }
    }

    pub fn info(&self) -> &DetectorInfo {
        match self {
            AnomalyDetector::Slo(d) => d.info(),
        }
    }

    pub fn into_scheduled(self) -> Arc<dyn ScheduledItem> {
        Arc::new(self)
    }
}

#[async_trait]
impl ScheduledItem for AnomalyDetector {
    fn application(&self) -> &str {
        &self.info().application
    }

    fn period(&self) -> Duration {
        Duration::from_secs(u64::from(self.info().period_in_seconds))
    }

    async fn run(&self, now: i64) -> Result<()> {
        match self {
            AnomalyDetector::Slo(d) => d.run(now).await,
        }
    }
}
