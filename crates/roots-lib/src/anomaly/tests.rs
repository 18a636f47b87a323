//! Pipeline tests: detection over a store, distribution on the bus and diagnosis

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::bottleneck::{BottleneckFinderService, PathReport, LOCAL};
use crate::config::{Properties, BI_FINDERS};
use crate::context::RootsContext;
use crate::error::DataStoreError;
use crate::health::HealthRegistry;
use crate::models::{ApiCall, ApplicationRequest, BenchmarkResult, ResponseTimeSummary};
use crate::stats::StatsEngineConfig;
use crate::store::{DataStore, InMemoryDataStore, StoreResult};

const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;
const NOW: i64 = 10_000_000;
/// Start of the first window the detector loads at `NOW`
const FIRST_START: i64 = NOW - MINUTE - HOUR;

/// Delegates to an in-memory store, failing benchmark queries while `fail` is set
struct FlakyStore {
    inner: InMemoryDataStore,
    fail: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryDataStore::new(),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DataStore for FlakyStore {
    async fn get_benchmark_results(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, Vec<BenchmarkResult>>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DataStoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.get_benchmark_results(application, start, end).await
    }

    async fn get_response_time_summary(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, ResponseTimeSummary>> {
        self.inner.get_response_time_summary(application, start, end).await
    }

    async fn get_response_time_history(
        &self,
        application: &str,
        start: i64,
        end: i64,
        period: i64,
    ) -> StoreResult<BTreeMap<String, Vec<ResponseTimeSummary>>> {
        self.inner
            .get_response_time_history(application, start, end, period)
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
        self.inner
            .get_workload_summary(application, operation, start, end, period)
            .await
    }

    async fn get_request_info(
        &self,
        application: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<BTreeMap<String, Vec<ApplicationRequest>>> {
        self.inner.get_request_info(application, start, end).await
    }

    async fn get_request_info_for_operation(
        &self,
        application: &str,
        operation: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<ApplicationRequest>> {
        self.inner
            .get_request_info_for_operation(application, operation, start, end)
            .await
    }

    async fn record_benchmark_result(&self, result: BenchmarkResult) -> StoreResult<()> {
        self.inner.record_benchmark_result(result).await
    }
}

#[derive(Default)]
struct RecordingSubscriber {
    received: Mutex<Vec<Anomaly>>,
}

impl RecordingSubscriber {
    fn received(&self) -> Vec<Anomaly> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnomalySubscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_anomaly(&self, anomaly: Arc<Anomaly>) -> Result<()> {
        self.received.lock().unwrap().push((*anomaly).clone());
        Ok(())
    }
}

/// One sample per minute of the first window; the `slow` indices take 900 ms
fn benchmark(slow: &[usize]) -> Vec<BenchmarkResult> {
    (0..60)
        .map(|i| {
            let response_time = if slow.contains(&i) { 900 } else { 100 };
            BenchmarkResult::new(FIRST_START + i as i64 * MINUTE, "app", "GET", "/x", response_time)
        })
        .collect()
}

async fn detector(
    samples: Vec<BenchmarkResult>,
) -> (SloBasedDetector, Arc<FlakyStore>, Arc<RecordingSubscriber>) {
    let store = Arc::new(FlakyStore::new());
    store.inner.add_benchmark_results(samples).await;
    let bus = AnomalyBus::new();
    let recorder = Arc::new(RecordingSubscriber::default());
    bus.subscribe(recorder.clone()).await;

    let detector =
        SloBasedDetector::new(SloDetectorConfig::new("app", 500), store.clone(), bus).unwrap();
    (detector, store, recorder)
}

#[tokio::test]
async fn test_slo_met_exactly_raises_nothing() {
    let (detector, _, recorder) = detector(benchmark(&[0, 1, 2])).await;
    detector.run(NOW).await.unwrap();
    assert!(recorder.received().is_empty());
    assert_eq!(detector.with_window(|w| w.count("GET /x")).await, 60);
}

#[tokio::test]
async fn test_slo_violation_publishes_anomaly() {
    let (detector, _, recorder) = detector(benchmark(&[0, 1, 2, 3])).await;
    detector.run(NOW).await.unwrap();

    let received = recorder.received();
    assert_eq!(received.len(), 1);
    let anomaly = &received[0];
    assert_eq!(anomaly.application, "app");
    assert_eq!(anomaly.operation, "GET /x");
    assert_eq!(anomaly.anomaly_type, AnomalyType::Performance);
    assert_eq!(anomaly.description, "SLA satisfaction: 93.3333");
    assert_eq!(anomaly.start, FIRST_START);
    assert_eq!(anomaly.end, NOW - MINUTE);
    assert_eq!(anomaly.period_in_seconds, 60);
}

#[tokio::test]
async fn test_window_slides_and_evicts() {
    let (detector, store, recorder) = detector(benchmark(&[57, 58, 59])).await;
    detector.run(NOW).await.unwrap();
    assert!(recorder.received().is_empty());

    // The oldest sample falls out of the window and a fourth slow one arrives
    store
        .record_benchmark_result(BenchmarkResult::new(NOW - MINUTE + 1000, "app", "GET", "/x", 900))
        .await
        .unwrap();
    detector.run(NOW + MINUTE).await.unwrap();

    let end = detector.with_window(|w| w.end()).await.unwrap();
    assert_eq!(end, NOW);
    let oldest = detector.with_window(|w| w.oldest()).await.unwrap();
    assert!(oldest >= end - HOUR);
    assert_eq!(detector.with_window(|w| w.count("GET /x")).await, 60);

    let received = recorder.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].description, "SLA satisfaction: 93.3333");
    assert_eq!(received[0].start, NOW - HOUR);
    assert_eq!(received[0].end, NOW);
}

#[tokio::test]
async fn test_partially_filled_window_is_not_judged() {
    let samples: Vec<BenchmarkResult> = benchmark(&(0..60).collect::<Vec<_>>())
        .into_iter()
        .take(50)
        .collect();
    let (detector, _, recorder) = detector(samples).await;
    detector.run(NOW).await.unwrap();

    assert!(recorder.received().is_empty());
    assert_eq!(detector.with_window(|w| w.count("GET /x")).await, 50);
}

#[tokio::test]
async fn test_fetch_error_keeps_watermark() {
    let (detector, store, recorder) = detector(benchmark(&[0, 1, 2, 3])).await;
    store.fail.store(true, Ordering::SeqCst);

    let err = detector.run(NOW).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(detector.with_window(|w| w.end()).await, None);

    // The next firing retries the same initial window
    store.fail.store(false, Ordering::SeqCst);
    detector.run(NOW).await.unwrap();
    assert_eq!(detector.with_window(|w| w.end()).await, Some(NOW - MINUTE));
    assert_eq!(recorder.received().len(), 1);
}

/// Small deterministic generator for request traces
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

/// Two-call traces over the two hours before `NOW`; the datastore call dominates variance
fn requests() -> Vec<ApplicationRequest> {
    let mut rng = Lcg(42);
    let mut requests = Vec::new();
    for minute in 0..120 {
        for i in 0..5 {
            let query = 20 + rng.next(100);
            let get = 5 + rng.next(10);
            let local = rng.next(5);
            requests.push(ApplicationRequest {
                request_id: format!("{minute}-{i}"),
                timestamp: NOW - 2 * HOUR + minute * MINUTE + i * 1000,
                application: "app".to_string(),
                operation: "GET /x".to_string(),
                api_calls: vec![
                    ApiCall::new("datastore", "query", query),
                    ApiCall::new("memcache", "get", get),
                ],
                response_time: query + get + local,
            });
        }
    }
    requests
}

fn performance_anomaly(properties: Properties) -> Anomaly {
    let detector = DetectorInfo {
        application: "app".to_string(),
        data_store: "default".to_string(),
        period_in_seconds: 60,
        history_length_in_seconds: 3600,
        properties,
    };
    Anomaly::new(&detector, NOW - HOUR, NOW, AnomalyType::Performance, "GET /x", "test")
}

async fn diagnose(properties: Properties) -> Vec<PathReport> {
    let store = InMemoryDataStore::new();
    store.add_requests(requests()).await;
    let ctx = RootsContext::new(
        Properties::new(),
        StatsEngineConfig::default(),
        Duration::from_secs(5),
        HealthRegistry::new(),
    );
    ctx.register_data_store("default", Arc::new(store));

    let service =
        BottleneckFinderService::new(ctx.stores().clone(), ctx.stats().clone(), Properties::new())
            .unwrap();
    let anomaly = performance_anomaly(properties);
    let finders = service.finders_for(&anomaly).unwrap();
    assert_eq!(finders.len(), 1);
    finders[0].analyze(&anomaly).await.unwrap()
}

#[tokio::test]
async fn test_relative_importance_conserves_variance() {
    let reports = diagnose(Properties::new()).await;
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.path, "datastore:query, memcache:get");

    let total: f64 = report.rankings.iter().map(|r| r.score).sum();
    assert!((total - 1.0).abs() < 1e-6);
    let explained = report.variance_explained.unwrap();
    assert!(explained > 0.9 && explained <= 1.0);

    let mut rankings: Vec<usize> = report.rankings.iter().map(|r| r.ranking).collect();
    rankings.sort_unstable();
    assert_eq!(rankings, vec![1, 2, 3]);

    let top = report.rankings.iter().find(|r| r.ranking == 1).unwrap();
    assert_eq!(top.name, "datastore:query");
    assert!(report.rankings.iter().any(|r| r.name == LOCAL));

    // One bucket of history per minute of the lookback once the frame is large enough
    assert_eq!(report.history.len(), 2);
    assert!(!report.trends.is_empty());
    for trend in &report.trends {
        let covered: usize = trend.segments.iter().map(|s| s.len()).sum();
        assert_eq!(covered, 60);
    }
}

#[tokio::test]
async fn test_percentile_finder_ranks_calls() {
    let reports = diagnose(Properties::new().with(BI_FINDERS, "Percentile")).await;
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.variance_explained.is_none());

    let names: Vec<&str> = report.rankings.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names.len(), 2);
    let top = report.rankings.iter().find(|r| r.ranking == 1).unwrap();
    assert_eq!(top.name, "datastore:query");
    assert_eq!(report.trends.len(), 2);
    assert_eq!(report.history[0].1.len(), 120);
}

#[tokio::test]
async fn test_detector_to_subscribers_through_context() {
    let store = InMemoryDataStore::new();
    store.add_benchmark_results(benchmark(&[0, 1, 2, 3])).await;
    store.add_requests(requests()).await;

    let ctx = RootsContext::new(
        Properties::new(),
        StatsEngineConfig::default(),
        Duration::from_secs(5),
        HealthRegistry::new(),
    );
    ctx.init().await;
    ctx.register_data_store("default", Arc::new(store));
    ctx.subscribe_default_services().await.unwrap();
    let recorder = Arc::new(RecordingSubscriber::default());
    ctx.bus().subscribe(recorder.clone()).await;

    let detectors = ctx
        .build_detectors(&[DetectorConfig::Slo(SloDetectorConfig::new("app", 500))])
        .unwrap();
    detectors[0].run(NOW).await.unwrap();

    assert_eq!(recorder.received().len(), 1);
    // Every borrowed session was returned
    assert_eq!(ctx.stats().available(), StatsEngineConfig::default().pool_size);
}
