//! Relative-importance bottleneck finder
//!
//! For each call path of the anomalous operation, total response time is regressed on
//! the per-call elapsed times. Requests are accumulated bucket by bucket, so each
//! bucket's ranking reflects all data up to and including that bucket. The share of
//! variance attributed to each call is then tracked over time and segmented to find
//! when a call's contribution shifted.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    bucket_start, describe_segments, group_by_path, rank, CallTrend, PathReport, RankedCall,
    LOCAL,
};
use crate::anomaly::Anomaly;
use crate::changepoint::{ChangePointDetector, PeltDetector};
use crate::error::{Result, StatsError};
use crate::models::ApplicationRequest;
use crate::observability::AnomalyLog;
use crate::stats::StatsEngine;
use crate::store::DataStoreRegistry;

/// Finds the internal call whose contribution to response time variance changed
pub struct RelativeImportanceFinder {
    stores: Arc<DataStoreRegistry>,
    stats: Arc<StatsEngine>,
    pelt_penalty: f64,
    log: AnomalyLog,
}

impl RelativeImportanceFinder {
    pub fn new(stores: Arc<DataStoreRegistry>, stats: Arc<StatsEngine>, pelt_penalty: f64) -> Self {
        Self {
            stores,
            stats,
            pelt_penalty,
            log: AnomalyLog::new("RelativeImportance"),
        }
    }

    pub fn pelt_penalty(&self) -> f64 {
        self.pelt_penalty
    }

    /// Analyze every call path of the anomalous operation
    ///
    /// A path that fails is logged and left out of the result.
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
        debug!(anomaly_id = %anomaly.id, requests = requests.len(), "Received requests for analysis");

        let mut reports = Vec::new();
        for (path, requests) in group_by_path(requests) {
            match self.analyze_path(anomaly, &path, &requests, start).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => self.log.error(anomaly, "Error while computing rankings", &e),
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
    ) -> Result<Option<PathReport>> {
        let calls: Vec<String> = match requests.first() {
            Some(first) => first.api_calls.iter().map(|c| c.name()).collect(),
            None => return Ok(None),
        };
        let call_count = calls.len();
        if call_count == 0 {
            return Ok(None);
        }
        if requests.len() < call_count + 2 {
            self.log.warn(
                anomaly,
                format!(
                    "Insufficient data to perform a bottleneck identification on path {path}: \
                     {} requests for {call_count} calls",
                    requests.len()
                ),
            );
            return Ok(None);
        }

        let period = i64::from(anomaly.period_in_seconds) * 1000;
        let mut buckets: BTreeMap<i64, Vec<&ApplicationRequest>> = BTreeMap::new();
        for request in requests {
            buckets
                .entry(bucket_start(request.timestamp, start, period))
                .or_default()
                .push(request);
        }

        let results = self.compute_rankings(&calls, &buckets).await?;
        let Some(latest) = results.values().next_back() else {
            return Ok(None);
        };
        let timestamps: Vec<i64> = results.keys().copied().collect();

        let variance_explained: f64 = latest
            .iter()
            .filter(|r| r.name != LOCAL)
            .map(|r| r.score)
            .sum();
        let mut summary = format!("Relative importance metrics for path: {path}\n");
        for r in latest {
            summary.push_str(&format!("[{:2}] {} {:.6}\n", r.ranking, r.name, r.score));
        }
        summary.push_str(&format!("\nTotal variance explained: {variance_explained}"));
        self.log.info(anomaly, summary);

        let mut trends = Vec::new();
        for position in 1..=call_count {
            let Some(index) = (0..call_count).find(|&i| latest[i].ranking == position) else {
                continue;
            };
            if let Some(trend) = self
                .analyze_history(anomaly, &results, &timestamps, position, index, &calls[index])
                .await
            {
                trends.push(trend);
            }
        }

        let history: Vec<(String, Vec<f64>)> = calls
            .iter()
            .enumerate()
            .map(|(i, call)| {
                let series: Vec<f64> = results.values().map(|r| r[i].score).collect();
                (call.clone(), series)
            })
            .collect();
        for (call, series) in &history {
            let trend = series
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.log
                .info(anomaly, format!("Historical trend for {call}: {trend}"));
        }

        Ok(Some(PathReport {
            path: path.to_string(),
            rankings: latest.clone(),
            variance_explained: Some(variance_explained),
            trends,
            history,
        }))
    }

    /// Rank calls after each bucket over the cumulative frame
    async fn compute_rankings(
        &self,
        calls: &[String],
        buckets: &BTreeMap<i64, Vec<&ApplicationRequest>>,
    ) -> Result<BTreeMap<i64, Vec<RankedCall>>> {
        let call_count = calls.len();
        let mut results = BTreeMap::new();
        let mut errors: Vec<StatsError> = Vec::new();

        let mut session = self.stats.borrow().await?;
        for (&timestamp, requests) in buckets {
            for request in requests {
                session.append_row(&request.response_time_vector())?;
            }
            if session.row_count() <= call_count + 1 {
                continue;
            }

            match session.relative_importance().await {
                Ok(decomposition) => {
                    let mut entries: Vec<(String, f64)> = calls
                        .iter()
                        .cloned()
                        .zip(decomposition.scores.iter().copied())
                        .collect();
                    let explained: f64 = decomposition.scores.iter().sum();
                    entries.push((LOCAL.to_string(), 1.0 - explained));
                    results.insert(timestamp, rank(entries));
                }
                Err(e) => {
                    if matches!(e, StatsError::SessionFailed(_)) {
                        session.mark_broken();
                    }
                    debug!(timestamp, error = %e, "Ranking failed for bucket");
                    errors.push(e);
                }
            }
        }
        drop(session);

        if results.is_empty() {
            let count = errors.len();
            if let Some(last) = errors.pop() {
                warn!(errors = count, "{count} errors encountered while computing rankings");
                return Err(last.into());
            }
        }
        Ok(results)
    }

    async fn analyze_history(
        &self,
        anomaly: &Anomaly,
        results: &BTreeMap<i64, Vec<RankedCall>>,
        timestamps: &[i64],
        position: usize,
        index: usize,
        call: &str,
    ) -> Option<CallTrend> {
        debug!(index, position, "Analyzing historical trend");
        let offset = timestamps.iter().filter(|&&t| t < anomaly.start).count();
        let trend: Vec<f64> = timestamps[offset..]
            .iter()
            .map(|t| results[t][index].score)
            .collect();

        let detector = ChangePointDetector::from(PeltDetector::with_manual_penalty(self.pelt_penalty));
        let segments = match self.stats.borrow().await {
            Ok(mut session) => detector.compute_segments(&mut *session, &trend).await,
            Err(e) => Err(e.into()),
        };
        let segments = match segments {
            Ok(segments) => segments,
            Err(e) => {
                self.log.error(anomaly, "Error while computing trends", &e);
                return None;
            }
        };

        let (level_shifts, net_change) = describe_segments(
            &self.log,
            anomaly,
            "relative importance",
            timestamps,
            offset,
            &segments,
        );
        Some(CallTrend {
            call: call.to_string(),
            ranking: position,
            segments,
            level_shifts,
            net_change,
        })
    }
}
