//! Percentile bottleneck finder
//!
//! Ranks the calls of each path by a high percentile of their elapsed time in the
//! latest bucket and segments every call's percentile history from the anomaly start.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::{
    bucket_start, describe_segments, group_by_path, rank, CallTrend, PathReport, RankedCall,
};
use crate::anomaly::Anomaly;
use crate::changepoint::{ChangePointDetector, PeltDetector};
use crate::error::{Result, RootsError};
use crate::models::ApplicationRequest;
use crate::observability::AnomalyLog;
use crate::stats::StatsEngine;
use crate::store::DataStoreRegistry;

/// Finds the internal call whose tail latency changed
pub struct PercentileFinder {
    stores: Arc<DataStoreRegistry>,
    stats: Arc<StatsEngine>,
    percentile: f64,
    log: AnomalyLog,
}

impl PercentileFinder {
    pub fn new(
        stores: Arc<DataStoreRegistry>,
        stats: Arc<StatsEngine>,
        percentile: f64,
    ) -> Result<Self> {
        Self::check_percentile(percentile)?;
        Ok(Self {
            stores,
            stats,
            percentile,
            log: AnomalyLog::new("Percentile"),
        })
    }

    pub fn check_percentile(percentile: f64) -> Result<()> {
        if percentile > 0.0 && percentile <= 100.0 {
            Ok(())
        } else {
            Err(RootsError::config(format!(
                "percentile must be in the interval (0,100], got {percentile}"
            )))
        }
    }

    pub async fn analyze(&self, anomaly: &Anomaly) -> Result<Vec<PathReport>> {
        let history = anomaly.end - anomaly.start;
        let start = anomaly.end - 2 * history;
        let store = self.stores.get(anomaly.data_store())?;

        let requests = match store
            .get_request_info_for_operation(&anomaly.application, &anomaly.operation, start, anomaly.end)
            .await
        {
            Ok(requests) => requests,
            Err(e) => {
                self.log
                    .error(anomaly, "Error while retrieving API call data", &e);
                return Err(e.into());
            }
        };

        let mut reports = Vec::new();
        for (path, requests) in group_by_path(requests) {
            if let Some(report) = self.analyze_path(anomaly, &path, &requests, start).await {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    async fn analyze_path(
        &self,
        anomaly: &Anomaly,
        path: &str,
        requests: &[ApplicationRequest],
        start: i64,
    ) -> Option<PathReport> {
        let calls: Vec<String> = requests
            .first()?
            .api_calls
            .iter()
            .map(|c| c.name())
            .collect();
        if calls.is_empty() {
            return None;
        }

        let period = i64::from(anomaly.period_in_seconds) * 1000;
        let mut buckets: BTreeMap<i64, Vec<&ApplicationRequest>> = BTreeMap::new();
        for request in requests {
            buckets
                .entry(bucket_start(request.timestamp, start, period))
                .or_default()
                .push(request);
        }

        // Per bucket, the configured percentile of each call's elapsed time
        let per_bucket: BTreeMap<i64, Vec<f64>> = buckets
            .iter()
            .map(|(&ts, requests)| {
                let values = (0..calls.len())
                    .map(|i| {
                        let mut samples: Vec<f64> = requests
                            .iter()
                            .filter_map(|r| r.api_calls.get(i))
                            .map(|c| c.time_elapsed as f64)
                            .collect();
                        percentile(&mut samples, self.percentile)
                    })
                    .collect();
                (ts, values)
            })
            .collect();
        let timestamps: Vec<i64> = per_bucket.keys().copied().collect();
        let latest_values = per_bucket.values().next_back()?;

        let latest: Vec<RankedCall> = rank(
            calls
                .iter()
                .cloned()
                .zip(latest_values.iter().copied())
                .collect(),
        );
        let mut summary = format!(
            "{}th percentile of API call latency for path: {path}\n",
            self.percentile
        );
        for r in &latest {
            summary.push_str(&format!("[{:2}] {} {:.2}\n", r.ranking, r.name, r.score));
        }
        self.log.info(anomaly, summary);

        let offset = timestamps.iter().filter(|&&t| t < anomaly.start).count();
        let detector = ChangePointDetector::from(PeltDetector::default());
        let mut trends = Vec::new();
        for position in 1..=calls.len() {
            let Some(index) = latest.iter().position(|r| r.ranking == position) else {
                continue;
            };
            let series: Vec<f64> = per_bucket.values().skip(offset).map(|v| v[index]).collect();
            debug!(call = %calls[index], points = series.len(), "Segmenting percentile history");

            let segments = match self.stats.borrow().await {
                Ok(mut session) => detector.compute_segments(&mut *session, &series).await,
                Err(e) => Err(e.into()),
            };
            match segments {
                Ok(segments) => {
                    let (level_shifts, net_change) = describe_segments(
                        &self.log,
                        anomaly,
                        "percentile",
                        &timestamps,
                        offset,
                        &segments,
                    );
                    trends.push(CallTrend {
                        call: calls[index].clone(),
                        ranking: position,
                        segments,
                        level_shifts,
                        net_change,
                    });
                }
                Err(e) => self.log.error(anomaly, "Error while computing trends", &e),
            }
        }

        let history = calls
            .iter()
            .enumerate()
            .map(|(i, call)| (call.clone(), per_bucket.values().map(|v| v[i]).collect()))
            .collect();

        Some(PathReport {
            path: path.to_string(),
            rankings: latest,
            variance_explained: None,
            trends,
            history,
        })
    }
}

/// Linearly interpolated percentile; 0 for an empty sample
fn percentile(samples: &mut [f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let rank = (p / 100.0) * (samples.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    samples[lower] + (samples[upper] - samples[lower]) * weight
}
