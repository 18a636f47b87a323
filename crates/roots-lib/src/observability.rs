//! Observability infrastructure for the detection pipeline
//!
//! Provides:
//! - Prometheus metrics (detector runs and failures, anomalies, subscriber failures,
//!   run and diagnosis latency, scheduled items, statistics sessions in use)
//! - Anomaly-scoped structured logging with tracing

use std::fmt::Display;
use std::sync::OnceLock;

use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Histogram, HistogramVec, IntCounterVec, IntGauge,
};
use tracing::{error, info, warn};

use crate::anomaly::Anomaly;

/// Histogram buckets for run and diagnosis latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RootsMetricsInner> = OnceLock::new();

struct RootsMetricsInner {
    detector_runs: IntCounterVec,
    detector_failures: IntCounterVec,
    anomalies_published: IntCounterVec,
    subscriber_failures: IntCounterVec,
    run_latency_seconds: Histogram,
    diagnosis_latency_seconds: HistogramVec,
    scheduled_items: IntGauge,
    stats_sessions_in_use: IntGauge,
}

impl RootsMetricsInner {
    fn new() -> Self {
        Self {
            detector_runs: register_int_counter_vec!(
                "roots_detector_runs_total",
                "Scheduled detector runs",
                &["application"]
            )
            .expect("Failed to register detector_runs"),

            detector_failures: register_int_counter_vec!(
                "roots_detector_failures_total",
                "Scheduled detector runs that failed or panicked",
                &["application"]
            )
            .expect("Failed to register detector_failures"),

            anomalies_published: register_int_counter_vec!(
                "roots_anomalies_published_total",
                "Anomalies published on the anomaly bus",
                &["type"]
            )
            .expect("Failed to register anomalies_published"),

            subscriber_failures: register_int_counter_vec!(
                "roots_subscriber_failures_total",
                "Anomaly deliveries that failed inside a subscriber",
                &["subscriber"]
            )
            .expect("Failed to register subscriber_failures"),

            run_latency_seconds: register_histogram!(
                "roots_detector_run_latency_seconds",
                "Time spent in a single detector run",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register run_latency_seconds"),

            diagnosis_latency_seconds: register_histogram_vec!(
                "roots_diagnosis_latency_seconds",
                "Time spent diagnosing one anomaly",
                &["subscriber"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register diagnosis_latency_seconds"),

            scheduled_items: register_int_gauge!(
                "roots_scheduled_items",
                "Items currently scheduled"
            )
            .expect("Failed to register scheduled_items"),

            stats_sessions_in_use: register_int_gauge!(
                "roots_stats_sessions_in_use",
                "Statistics sessions currently borrowed"
            )
            .expect("Failed to register stats_sessions_in_use"),
        }
    }
}

/// Handle to the process-wide pipeline metrics
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct RootsMetrics {
    _private: (),
}

impl Default for RootsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RootsMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RootsMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RootsMetricsInner {
        GLOBAL_METRICS.get_or_init(RootsMetricsInner::new)
    }

    pub fn inc_detector_runs(&self, application: &str) {
        self.inner()
            .detector_runs
            .with_label_values(&[application])
            .inc();
    }

    pub fn inc_detector_failures(&self, application: &str) {
        self.inner()
            .detector_failures
            .with_label_values(&[application])
            .inc();
    }

    pub fn inc_anomalies_published(&self, anomaly_type: &str) {
        self.inner()
            .anomalies_published
            .with_label_values(&[anomaly_type])
            .inc();
    }

    pub fn inc_subscriber_failures(&self, subscriber: &str) {
        self.inner()
            .subscriber_failures
            .with_label_values(&[subscriber])
            .inc();
    }

    pub fn observe_run_latency(&self, duration_secs: f64) {
        self.inner().run_latency_seconds.observe(duration_secs);
    }

    pub fn observe_diagnosis_latency(&self, subscriber: &str, duration_secs: f64) {
        self.inner()
            .diagnosis_latency_seconds
            .with_label_values(&[subscriber])
            .observe(duration_secs);
    }

    pub fn set_scheduled_items(&self, count: i64) {
        self.inner().scheduled_items.set(count);
    }

    pub fn inc_sessions_in_use(&self) {
        self.inner().stats_sessions_in_use.inc();
    }

    pub fn dec_sessions_in_use(&self) {
        self.inner().stats_sessions_in_use.dec();
    }
}

/// Structured log output scoped to one anomaly
///
/// Every entry carries the anomaly id, application and operation so diagnosis
/// findings can be correlated with the detection that triggered them.
#[derive(Debug, Clone)]
pub struct AnomalyLog {
    source: String,
}

impl AnomalyLog {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn info(&self, anomaly: &Anomaly, message: impl Display) {
        info!(
            event = "anomaly_diagnosis",
            source = %self.source,
            anomaly_id = %anomaly.id,
            application = %anomaly.application,
            operation = %anomaly.operation,
            "{}",
            message
        );
    }

    pub fn warn(&self, anomaly: &Anomaly, message: impl Display) {
        warn!(
            event = "anomaly_diagnosis",
            source = %self.source,
            anomaly_id = %anomaly.id,
            application = %anomaly.application,
            operation = %anomaly.operation,
            "{}",
            message
        );
    }

    pub fn error(&self, anomaly: &Anomaly, message: impl Display, err: &dyn std::error::Error) {
        error!(
            event = "anomaly_diagnosis_failed",
            source = %self.source,
            anomaly_id = %anomaly.id,
            application = %anomaly.application,
            operation = %anomaly.operation,
            error = %err,
            "{}",
            message
        );
    }

    /// Log a freshly detected anomaly
    pub fn detected(&self, anomaly: &Anomaly) {
        warn!(
            event = "anomaly_detected",
            source = %self.source,
            anomaly_id = %anomaly.id,
            application = %anomaly.application,
            operation = %anomaly.operation,
            anomaly_type = %anomaly.anomaly_type,
            start = anomaly.start,
            end = anomaly.end,
            description = %anomaly.description,
            "Anomaly detected"
        );
    }
}
