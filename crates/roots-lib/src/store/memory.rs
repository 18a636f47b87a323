//! In-memory metrics store, optionally seeded from a JSON snapshot

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::{check_window, parse_operation, DataStore, StoreResult};
use crate::error::DataStoreError;
use crate::models::{AccessLogEntry, ApplicationRequest, BenchmarkResult, ResponseTimeSummary};

/// Serialized contents of an [`InMemoryDataStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSnapshot {
    pub benchmark_results: Vec<BenchmarkResult>,
    pub access_log: Vec<AccessLogEntry>,
    pub requests: Vec<ApplicationRequest>,
}

/// Metrics store backed by in-process vectors
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    data: RwLock<StoreSnapshot>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            data: RwLock::new(snapshot),
        }
    }

    /// Load a snapshot written as JSON
    pub async fn from_json_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            DataStoreError::Unavailable(format!("failed to read {}: {e}", path.display()))
        })?;
        let snapshot: StoreSnapshot = serde_json::from_str(&raw).map_err(|e| {
            DataStoreError::Protocol(format!("invalid snapshot {}: {e}", path.display()))
        })?;
        info!(
            path = %path.display(),
            benchmark_results = snapshot.benchmark_results.len(),
            access_log = snapshot.access_log.len(),
            requests = snapshot.requests.len(),
            "Loaded data store snapshot"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.data.read().await.clone()
    }

    pub async fn add_benchmark_results(&self, results: impl IntoIterator<Item = BenchmarkResult>) {
        self.data.write().await.benchmark_results.extend(results);
    }

    pub async fn add_access_log_entries(&self, entries: impl IntoIterator<Item = AccessLogEntry>) {
        self.data.write().await.access_log.extend(entries);
    }

    pub async fn add_requests(&self, requests: impl IntoIterator<Item = ApplicationRequest>) {
        self.data.write().await.requests.extend(requests);
    }
}

fn in_window(timestamp: i64, start: i64, end: i64) -> bool {
    timestamp >= start && timestamp < end
}

fn check_period(period: i64) -> StoreResult<()> {
    if period <= 0 {
        return Err(DataStoreError::Protocol(format!(
            "bucket period must be positive, got {period}"
        )));
    }
    Ok(())
}

fn summarize<'a>(timestamp: i64, entries: impl Iterator<Item = &'a AccessLogEntry>) -> ResponseTimeSummary {
    let (total, count) = entries.fold((0u64, 0u64), |(t, c), e| (t + e.response_time, c + 1));
    ResponseTimeSummary {
        timestamp,
        mean_response_time: if count == 0 { 0.0 } else { total as f64 / count as f64 },
        request_count: count,
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get_benchmark_results(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, Vec<BenchmarkResult>>> {
        check_window(start, end)?;
        let data = self.data.read().await;
        let mut results: BTreeMap<String, Vec<BenchmarkResult>> = BTreeMap::new();
        for r in data
            .benchmark_results
            .iter()
            .filter(|r| r.application == application && in_window(r.timestamp, start, end))
        {
            results.entry(r.operation()).or_default().push(r.clone());
        }
        for list in results.values_mut() {
            list.sort_by_key(|r| r.timestamp);
        }
        Ok(results)
    }

    async fn get_response_time_summary(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, ResponseTimeSummary>> {
        check_window(start, end)?;
        let data = self.data.read().await;
        let mut grouped: BTreeMap<String, Vec<&AccessLogEntry>> = BTreeMap::new();
        for e in data
            .access_log
            .iter()
            .filter(|e| e.application == application && in_window(e.timestamp, start, end))
        {
            grouped.entry(e.operation()).or_default().push(e);
        }
        Ok(grouped
            .into_iter()
            .map(|(op, entries)| (op, summarize(start, entries.into_iter())))
            .collect())
    }

    async fn get_response_time_history(
        &self,
        application: &str,
        start: i64,
        end: i64,
        period: i64,
    ) -> StoreResult<BTreeMap<String, Vec<ResponseTimeSummary>>> {
        check_window(start, end)?;
        check_period(period)?;
        let data = self.data.read().await;
        let mut grouped: BTreeMap<String, BTreeMap<i64, Vec<&AccessLogEntry>>> = BTreeMap::new();
        for e in data
            .access_log
            .iter()
            .filter(|e| e.application == application && in_window(e.timestamp, start, end))
        {
            let bucket = start + (e.timestamp - start) / period * period;
            grouped
                .entry(e.operation())
                .or_default()
                .entry(bucket)
                .or_default()
                .push(e);
        }
        Ok(grouped
            .into_iter()
            .map(|(op, buckets)| {
                let history = buckets
                    .into_iter()
                    .map(|(ts, entries)| summarize(ts, entries.into_iter()))
                    .collect();
                (op, history)
            })
            .collect())
    }

    async fn get_workload_summary(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
        period: i64,
    ) -> StoreResult<Vec<f64>> {
        let (method, path) = parse_operation(operation)?;
        check_window(start, end)?;
        check_period(period)?;
        let data = self.data.read().await;

        let buckets = ((end - start + period - 1) / period) as usize;
        let mut counts = vec![0.0; buckets];
        let mut matched = false;
        for e in data.access_log.iter().filter(|e| {
            e.application == application
                && e.method == method
                && e.path == path
                && in_window(e.timestamp, start, end)
        }) {
            counts[((e.timestamp - start) / period) as usize] += 1.0;
            matched = true;
        }
        if !matched {
            counts.clear();
        }
        Ok(counts)
    }

    async fn get_request_info(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, Vec<ApplicationRequest>>> {
        check_window(start, end)?;
        let data = self.data.read().await;
        let mut grouped: BTreeMap<String, Vec<ApplicationRequest>> = BTreeMap::new();
        for r in data
            .requests
            .iter()
            .filter(|r| r.application == application && in_window(r.timestamp, start, end))
        {
            grouped.entry(r.operation.clone()).or_default().push(r.clone());
        }
        for list in grouped.values_mut() {
            list.sort_by_key(|r| r.timestamp);
        }
        Ok(grouped)
    }

    async fn get_request_info_for_operation(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<ApplicationRequest>> {
        check_window(start, end)?;
        let data = self.data.read().await;
        let mut requests: Vec<ApplicationRequest> = data
            .requests
            .iter()
            .filter(|r| {
                r.application == application
                    && r.operation == operation
                    && in_window(r.timestamp, start, end)
            })
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.timestamp);
        Ok(requests)
    }

    async fn record_benchmark_result(&self, result: BenchmarkResult) -> StoreResult<()> {
        self.data.write().await.benchmark_results.push(result);
        Ok(())
    }
}
