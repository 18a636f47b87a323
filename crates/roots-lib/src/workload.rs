//! Workload change analysis
//!
//! For every anomaly, the request rate of the anomalous operation over the doubled
//! lookback window is segmented to tell whether the anomaly coincides with a sharp
//! increase in load. Findings are advisory and only reported through the log.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::anomaly::{Anomaly, AnomalySubscriber};
use crate::bottleneck::format_timestamp;
use crate::changepoint::ChangePointDetector;
use crate::config::{Properties, WORKLOAD_ANALYZER};
use crate::error::Result;
use crate::observability::AnomalyLog;
use crate::stats::StatsEngine;
use crate::store::DataStoreRegistry;

pub const DEFAULT_CHANGE_POINT_DETECTOR: &str = "PELT";

/// Percentage increase above which a workload shift is reported
pub const WORKLOAD_INCREASE_THRESHOLD: f64 = 200.0;

/// A sharp workload increase between two adjacent segments
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadFinding {
    /// Start of the first bucket of the later segment
    pub timestamp: i64,
    pub before: f64,
    pub after: f64,
    pub percentage: f64,
}

pub struct WorkloadAnalyzerService {
    stores: Arc<DataStoreRegistry>,
    stats: Arc<StatsEngine>,
    detector: ChangePointDetector,
    log: AnomalyLog,
}

impl WorkloadAnalyzerService {
    /// Build the service with the change point detector named by `workload.analyzer`
    pub fn new(
        stores: Arc<DataStoreRegistry>,
        stats: Arc<StatsEngine>,
        properties: &Properties,
    ) -> Result<Self> {
        let name = properties.get_or(WORKLOAD_ANALYZER, DEFAULT_CHANGE_POINT_DETECTOR);
        let detector = ChangePointDetector::from_name(name)?;
        info!(detector = detector.name(), "Workload analyzer configured");
        Ok(Self {
            stores,
            stats,
            detector,
            log: AnomalyLog::new("WorkloadAnalyzer"),
        })
    }

    pub fn detector(&self) -> &ChangePointDetector {
        &self.detector
    }

    /// Find workload increases over the anomaly's lookback window
    pub async fn analyze(&self, anomaly: &Anomaly) -> Result<Vec<WorkloadFinding>> {
        let history = anomaly.end - anomaly.start;
        let start = anomaly.end - 2 * history;
        let period = i64::from(anomaly.period_in_seconds) * 1000;

        let store = self.stores.get(anomaly.data_store())?;
        let summary = store
            .get_workload_summary(
                &anomaly.application,
                &anomaly.operation,
                start,
                anomaly.end,
                period,
            )
            .await?;
        if summary.is_empty() {
            self.log.warn(
                anomaly,
                format!("No workload data found for {}", anomaly.application),
            );
            return Ok(Vec::new());
        }
        debug!(anomaly_id = %anomaly.id, buckets = summary.len(), "Segmenting workload");

        let segments = {
            let mut session = self.stats.borrow().await?;
            self.detector
                .compute_segments(&mut *session, &summary)
                .await?
        };

        let mut findings = Vec::new();
        for pair in segments.windows(2) {
            let increase = pair[0].percentage_increase(&pair[1]);
            if increase > WORKLOAD_INCREASE_THRESHOLD {
                let finding = WorkloadFinding {
                    timestamp: start + pair[1].start as i64 * period,
                    before: pair[0].mean,
                    after: pair[1].mean,
                    percentage: increase,
                };
                self.log.warn(
                    anomaly,
                    format!(
                        "Problematic workload increase at {}: {} --> {}",
                        format_timestamp(finding.timestamp),
                        finding.before,
                        finding.after
                    ),
                );
                findings.push(finding);
            }
        }
        Ok(findings)
    }
}

#[async_trait]
impl AnomalySubscriber for WorkloadAnalyzerService {
    fn name(&self) -> &str {
        "workload-analyzer"
    }

    async fn on_anomaly(&self, anomaly: Arc<Anomaly>) -> Result<()> {
        if let Err(e) = self.analyze(&anomaly).await {
            self.log
                .error(&anomaly, "Error while computing workload changes", &e);
        }
        Ok(())
    }
}
