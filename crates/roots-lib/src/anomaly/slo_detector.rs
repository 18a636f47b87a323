//! SLO-based anomaly detection over a rolling window of benchmark samples
//!
//! The first run loads a full history window ending one minute before `now`. Every
//! later run fetches the next `period` after the watermark, evicts samples older than
//! the history length and checks each operation that received new samples. An
//! operation is only judged once its window is sufficiently filled.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{Anomaly, AnomalyBus, AnomalyType, DetectorInfo};
use crate::config::{deserialize_seconds, Properties};
use crate::error::{Result, RootsError};
use crate::models::BenchmarkResult;
use crate::observability::AnomalyLog;
use crate::store::DataStore;

/// Lag applied to the first window so samples still being written are not missed
const INITIAL_LAG_MILLIS: i64 = 60 * 1000;

fn default_data_store() -> String {
    "default".to_string()
}

fn default_period() -> u32 {
    60
}

fn default_history() -> u32 {
    3600
}

fn default_sampling_interval() -> u32 {
    60
}

fn default_percentage() -> f64 {
    95.0
}

/// Settings of an SLO-based detector
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SloDetectorConfig {
    pub application: String,

    #[serde(default = "default_data_store")]
    pub data_store: String,

    #[serde(
        default = "default_period",
        alias = "period",
        deserialize_with = "deserialize_seconds"
    )]
    pub period_in_seconds: u32,

    #[serde(
        default = "default_history",
        alias = "history",
        deserialize_with = "deserialize_seconds"
    )]
    pub history_length_in_seconds: u32,

    #[serde(
        default = "default_sampling_interval",
        alias = "sampling_interval",
        deserialize_with = "deserialize_seconds"
    )]
    pub sampling_interval_in_seconds: u32,

    /// Response time bound in milliseconds
    #[serde(alias = "upper_bound")]
    pub response_time_upper_bound: u64,

    #[serde(default = "default_percentage")]
    pub slo_percentage: f64,

    #[serde(default = "default_percentage")]
    pub window_fill_percentage: f64,

    #[serde(default)]
    pub properties: Properties,
}

impl SloDetectorConfig {
    /// Configuration with the default period, history, sampling interval and percentages
    pub fn new(application: impl Into<String>, response_time_upper_bound: u64) -> Self {
        Self {
            application: application.into(),
            data_store: default_data_store(),
            period_in_seconds: default_period(),
            history_length_in_seconds: default_history(),
            sampling_interval_in_seconds: default_sampling_interval(),
            response_time_upper_bound,
            slo_percentage: default_percentage(),
            window_fill_percentage: default_percentage(),
            properties: Properties::new(),
        }
    }

    fn detector_info(&self) -> DetectorInfo {
        DetectorInfo {
            application: self.application.clone(),
            data_store: self.data_store.clone(),
            period_in_seconds: self.period_in_seconds,
            history_length_in_seconds: self.history_length_in_seconds,
            properties: self.properties.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        self.detector_info().validate()?;
        if self.sampling_interval_in_seconds == 0 {
            return Err(RootsError::config("sampling interval must be positive"));
        }
        if self.history_length_in_seconds <= self.sampling_interval_in_seconds {
            return Err(RootsError::config(
                "history length must be larger than sampling interval",
            ));
        }
        if self.response_time_upper_bound == 0 {
            return Err(RootsError::config(
                "response time upper bound must be positive",
            ));
        }
        if !(self.slo_percentage > 0.0 && self.slo_percentage < 100.0) {
            return Err(RootsError::config(
                "SLO percentage must be in the interval (0,100)",
            ));
        }
        if !(self.window_fill_percentage > 0.0 && self.window_fill_percentage <= 100.0) {
            return Err(RootsError::config(
                "window fill percentage must be in the interval (0,100]",
            ));
        }
        Ok(())
    }
}

/// Benchmark samples per operation plus the exclusive end of the data seen so far
#[derive(Debug, Default)]
pub struct RollingWindow {
    samples: HashMap<String, VecDeque<BenchmarkResult>>,
    end: Option<i64>,
}

impl RollingWindow {
    pub fn end(&self) -> Option<i64> {
        self.end
    }

    pub fn count(&self, operation: &str) -> usize {
        self.samples.get(operation).map_or(0, VecDeque::len)
    }

    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self.samples.keys().cloned().collect();
        ops.sort();
        ops
    }

    /// Timestamp of the oldest retained sample across all operations
    pub fn oldest(&self) -> Option<i64> {
        self.samples
            .values()
            .filter_map(|q| q.iter().map(|r| r.timestamp).min())
            .min()
    }

    fn ingest(&mut self, fetched: BTreeMap<String, Vec<BenchmarkResult>>) {
        for (operation, results) in fetched {
            self.samples.entry(operation).or_default().extend(results);
        }
    }

    fn evict(&mut self, cutoff: i64) {
        for queue in self.samples.values_mut() {
            queue.retain(|r| r.timestamp >= cutoff);
        }
        self.samples.retain(|_, q| !q.is_empty());
    }
}

/// Detects operations whose share of fast-enough benchmark samples drops below the SLO
pub struct SloBasedDetector {
    info: DetectorInfo,
    sampling_interval_in_seconds: u32,
    response_time_upper_bound: u64,
    slo_percentage: f64,
    window_fill_percentage: f64,
    store: Arc<dyn DataStore>,
    bus: AnomalyBus,
    window: Mutex<RollingWindow>,
    log: AnomalyLog,
}

impl SloBasedDetector {
    /// Validate the configuration and build a detector in the uninitialized state
    pub fn new(config: SloDetectorConfig, store: Arc<dyn DataStore>, bus: AnomalyBus) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            info: config.detector_info(),
            sampling_interval_in_seconds: config.sampling_interval_in_seconds,
            response_time_upper_bound: config.response_time_upper_bound,
            slo_percentage: config.slo_percentage,
            window_fill_percentage: config.window_fill_percentage,
            store,
            bus,
            window: Mutex::new(RollingWindow::default()),
            log: AnomalyLog::new("SLOBasedDetector"),
        })
    }

    pub fn info(&self) -> &DetectorInfo {
        &self.info
    }

    /// Access the rolling window, e.g. for inspection
    pub async fn with_window<R>(&self, f: impl FnOnce(&RollingWindow) -> R) -> R {
        f(&*self.window.lock().await)
    }

    /// Minimum sample count an operation needs before it is evaluated
    fn fill_threshold(&self) -> f64 {
        let max_samples = self.info.history_length_in_seconds / self.sampling_interval_in_seconds;
        f64::from(max_samples) * self.window_fill_percentage / 100.0
    }

    /// Advance the window and publish anomalies for operations violating the SLO
    pub async fn run(&self, now: i64) -> Result<()> {
        let application = &self.info.application;
        let history = self.info.history_millis();

        let anomalies = {
            let mut window = self.window.lock().await;
            let (start, end) = match window.end {
                None => {
                    let end = now - INITIAL_LAG_MILLIS;
                    (end - history, end)
                }
                Some(end) => (end, end + self.info.period_millis()),
            };
            debug!(application = %application, start, end, "Updating history");

            let fetched = match self.store.get_benchmark_results(application, start, end).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    error!(
                        application = %application,
                        data_store = %self.info.data_store,
                        error = %e,
                        "Error while retrieving data"
                    );
                    return Err(e.into());
                }
            };
            let touched: Vec<String> = fetched.keys().cloned().collect();
            window.ingest(fetched);
            window.end = Some(end);

            let cutoff = end - history;
            window.evict(cutoff);

            let threshold = self.fill_threshold();
            touched
                .into_iter()
                .filter_map(|operation| {
                    let samples = window.samples.get(&operation)?;
                    if (samples.len() as f64) < threshold {
                        return None;
                    }
                    self.evaluate(cutoff, end, operation, samples)
                })
                .collect::<Vec<_>>()
        };

        for anomaly in anomalies {
            self.log.detected(&anomaly);
            self.bus.publish(anomaly).await;
        }
        Ok(())
    }

    fn evaluate(
        &self,
        start: i64,
        end: i64,
        operation: String,
        samples: &VecDeque<BenchmarkResult>,
    ) -> Option<Anomaly> {
        let satisfied = samples
            .iter()
            .filter(|r| r.response_time <= self.response_time_upper_bound)
            .count();
        let supported = satisfied as f64 * 100.0 / samples.len() as f64;
        info!(
            application = %self.info.application,
            operation = %operation,
            samples = samples.len(),
            supported,
            expected = self.slo_percentage,
            "SLO metrics"
        );
        (supported < self.slo_percentage).then(|| {
            Anomaly::new(
                &self.info,
                start,
                end,
                AnomalyType::Performance,
                operation,
                format!("SLA satisfaction: {supported:.4}"),
            )
        })
    }
}
