//! Metrics store contract and registry
//!
//! Every query takes a half-open window `[start, end)` in epoch milliseconds.
//! Stores registered with a [`DataStoreRegistry`] are wrapped so that each call is
//! bounded by the registry's call timeout.

mod memory;

pub use memory::{InMemoryDataStore, StoreSnapshot};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::error::{DataStoreError, Result, RootsError};
use crate::models::{ApplicationRequest, BenchmarkResult, ResponseTimeSummary};

/// Default bound on a single store call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub type StoreResult<T> = std::result::Result<T, DataStoreError>;

/// Time-windowed query interface over collected performance data
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Benchmark samples per operation, time ordered
    async fn get_benchmark_results(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, Vec<BenchmarkResult>>>;

    /// Mean response time and request count per operation over the window
    async fn get_response_time_summary(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, ResponseTimeSummary>>;

    /// Per-bucket response time summaries per operation; buckets are `period` ms wide
    async fn get_response_time_history(
        &self,
        application: &str,
        start: i64,
        end: i64,
        period: i64,
    ) -> StoreResult<BTreeMap<String, Vec<ResponseTimeSummary>>>;

    /// Request count per bucket for one `"METHOD path"` operation, aligned to `start`
    ///
    /// Empty when no request matched the operation in the window.
    async fn get_workload_summary(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
        period: i64,
    ) -> StoreResult<Vec<f64>>;

    /// Request traces per operation, time ordered
    async fn get_request_info(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, Vec<ApplicationRequest>>>;

    /// Request traces for a single operation, time ordered
    async fn get_request_info_for_operation(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<ApplicationRequest>>;

    async fn record_benchmark_result(&self, result: BenchmarkResult) -> StoreResult<()>;
}

/// Split `"METHOD path"` at the first space
pub fn parse_operation(operation: &str) -> StoreResult<(&str, &str)> {
    match operation.split_once(' ') {
        Some((method, path)) if !method.is_empty() => Ok((method, path)),
        _ => Err(DataStoreError::InvalidOperation(operation.to_string())),
    }
}

pub(crate) fn check_window(start: i64, end: i64) -> StoreResult<()> {
    if start > end {
        return Err(DataStoreError::InvalidWindow { start, end });
    }
    Ok(())
}

/// Bound a store call by `timeout`
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| DataStoreError::Timeout(timeout))?
}

/// Wraps a store so every call honors a timeout
struct TimedDataStore {
    inner: Arc<dyn DataStore>,
    timeout: Duration,
}

#[async_trait]
impl DataStore for TimedDataStore {
    async fn get_benchmark_results(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, Vec<BenchmarkResult>>> {
        with_timeout(
            self.timeout,
            self.inner.get_benchmark_results(application, start, end),
        )
        .await
    }

    async fn get_response_time_summary(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, ResponseTimeSummary>> {
        with_timeout(
            self.timeout,
            self.inner.get_response_time_summary(application, start, end),
        )
        .await
    }

    async fn get_response_time_history(
        &self,
        application: &str,
        start: i64,
        end: i64,
        period: i64,
    ) -> StoreResult<BTreeMap<String, Vec<ResponseTimeSummary>>> {
        with_timeout(
            self.timeout,
            self.inner
                .get_response_time_history(application, start, end, period),
        )
        .await
    }

    async fn get_workload_summary(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
        period: i64,
    ) -> StoreResult<Vec<f64>> {
        with_timeout(
            self.timeout,
            self.inner
                .get_workload_summary(application, operation, start, end, period),
        )
        .await
    }

    async fn get_request_info(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, Vec<ApplicationRequest>>> {
        with_timeout(
            self.timeout,
            self.inner.get_request_info(application, start, end),
        )
        .await
    }

    async fn get_request_info_for_operation(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<ApplicationRequest>> {
        with_timeout(
            self.timeout,
            self.inner
                .get_request_info_for_operation(application, operation, start, end),
        )
        .await
    }

    async fn record_benchmark_result(&self, result: BenchmarkResult) -> StoreResult<()> {
        with_timeout(self.timeout, self.inner.record_benchmark_result(result)).await
    }
}

/// Named metrics stores available to detectors and diagnosis services
pub struct DataStoreRegistry {
    stores: DashMap<String, Arc<dyn DataStore>>,
    call_timeout: Duration,
}

impl Default for DataStoreRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl DataStoreRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            stores: DashMap::new(),
            call_timeout,
        }
    }

    /// Register (or replace) a store under `name`
    pub fn register(&self, name: impl Into<String>, store: Arc<dyn DataStore>) {
        let name = name.into();
        info!(data_store = %name, "Registered data store");
        let timed: Arc<dyn DataStore> = Arc::new(TimedDataStore {
            inner: store,
            timeout: self.call_timeout,
        });
        self.stores.insert(name, timed);
    }

    /// Resolve a store by name; unknown names are a configuration error
    pub fn get(&self, name: &str) -> Result<Arc<dyn DataStore>> {
        self.stores
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RootsError::config(format!("unknown data store: {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn clear(&self) {
        self.stores.clear();
    }
}
