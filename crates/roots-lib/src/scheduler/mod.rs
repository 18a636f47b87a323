//! Periodic job scheduling on a fixed-size worker pool
//!
//! Every registered item gets its own ticker task. A tick waits for a free worker
//! permit, runs the item to completion in a separate task (so a panic is contained),
//! then returns the permit. Ticks that fall due while an item is still running or
//! waiting for a worker are skipped rather than queued.
//!
//! A cancelled ticker keeps draining until its in-flight run returns. Re-registering
//! the same application chains the new ticker behind the draining one, so runs of one
//! application never overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RootsError};
use crate::health::{components, HealthRegistry};
use crate::observability::RootsMetrics;

/// Default worker count
pub const DEFAULT_THREAD_COUNT: usize = 10;

/// A unit of periodic work identified by its application name
#[async_trait]
pub trait ScheduledItem: Send + Sync + 'static {
    fn application(&self) -> &str;

    fn period(&self) -> Duration;

    /// Execute one firing; `now` is the firing time in epoch milliseconds
    async fn run(&self, now: i64) -> Result<()>;
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub instance_name: String,
    /// Maximum number of items running at once
    pub thread_count: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: "roots-scheduler".to_string(),
            thread_count: DEFAULT_THREAD_COUNT,
        }
    }
}

struct ScheduledHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Fires scheduled items on their own periods using a bounded worker pool
pub struct SchedulerService {
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    items: DashMap<String, ScheduledHandle>,
    /// Tickers cancelled while a run may still be in flight
    draining: DashMap<String, JoinHandle<()>>,
    stopped: AtomicBool,
    health: HealthRegistry,
    metrics: RootsMetrics,
}

impl SchedulerService {
    pub fn new(config: SchedulerConfig, health: HealthRegistry) -> Self {
        let thread_count = config.thread_count.max(1);
        Self {
            workers: Arc::new(Semaphore::new(thread_count)),
            config,
            items: DashMap::new(),
            draining: DashMap::new(),
            stopped: AtomicBool::new(false),
            health,
            metrics: RootsMetrics::new(),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.config.instance_name
    }

    /// Schedule the initial items; an item that cannot be scheduled is logged and skipped
    ///
    /// Returns the number of items scheduled.
    pub async fn start(&self, items: Vec<Arc<dyn ScheduledItem>>) -> usize {
        self.health.register(components::SCHEDULER).await;
        info!(
            scheduler = %self.config.instance_name,
            thread_count = self.config.thread_count,
            items = items.len(),
            "Starting scheduler"
        );

        let mut scheduled = 0;
        for item in items {
            let application = item.application().to_string();
            match self.register(item).await {
                Ok(()) => scheduled += 1,
                Err(e) => error!(
                    scheduler = %self.config.instance_name,
                    application = %application,
                    error = %e,
                    "Failed to schedule item"
                ),
            }
        }
        scheduled
    }

    /// Schedule an item; it fires immediately and then once per period
    ///
    /// Fails without side effects if the application is already scheduled here.
    pub async fn register(&self, item: Arc<dyn ScheduledItem>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RootsError::SchedulerStopped(
                self.config.instance_name.clone(),
            ));
        }
        if item.period().is_zero() {
            return Err(RootsError::config(format!(
                "period of {} must be positive",
                item.application()
            )));
        }

        let application = item.application().to_string();
        self.spawn_ticker(&application, item)?;

        self.health.register(&components::detector(&application)).await;
        self.metrics.set_scheduled_items(self.items.len() as i64);
        info!(
            scheduler = %self.config.instance_name,
            application = %application,
            "Scheduled item"
        );
        Ok(())
    }

    /// Insert the ticker for a new item, chained behind any draining ticker of the
    /// same application
    ///
    /// Both maps are locked draining first, then items, here and in `detach`.
    fn spawn_ticker(&self, application: &str, item: Arc<dyn ScheduledItem>) -> Result<()> {
        let draining = self.draining.entry(application.to_string());
        let Entry::Vacant(slot) = self.items.entry(application.to_string()) else {
            return Err(RootsError::DuplicateItem(application.to_string()));
        };
        let previous = match draining {
            Entry::Occupied(entry) => Some(entry.remove()),
            Entry::Vacant(_) => None,
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(drive(
            item,
            previous,
            self.workers.clone(),
            cancel.clone(),
            self.health.clone(),
            self.metrics.clone(),
        ));
        slot.insert(ScheduledHandle { cancel, task });
        Ok(())
    }

    /// Cancel an application's ticker and park it until its in-flight run returns
    fn detach(&self, application: &str) -> bool {
        let draining = self.draining.entry(application.to_string());
        let Some((_, handle)) = self.items.remove(application) else {
            return false;
        };
        handle.cancel.cancel();
        draining.insert(handle.task);
        true
    }

    /// Stop future firings of an application
    ///
    /// An in-flight run is left to finish; `stop` waits for it.
    pub async fn cancel(&self, application: &str) -> bool {
        if !self.detach(application) {
            return false;
        }
        self.health
            .unregister(&components::detector(application))
            .await;
        self.metrics.set_scheduled_items(self.items.len() as i64);
        info!(
            scheduler = %self.config.instance_name,
            application = %application,
            "Cancelled scheduled item"
        );
        true
    }

    pub fn is_scheduled(&self, application: &str) -> bool {
        self.items.contains_key(application)
    }

    pub fn scheduled_applications(&self) -> Vec<String> {
        let mut names: Vec<String> = self.items.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Cancel every item and wait for in-flight runs to finish, including those of
    /// items cancelled earlier
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(scheduler = %self.config.instance_name, "Stopping scheduler");

        let applications: Vec<String> = self.items.iter().map(|e| e.key().clone()).collect();
        for application in &applications {
            self.detach(application);
        }
        let keys: Vec<String> = self.draining.iter().map(|e| e.key().clone()).collect();
        let handles: Vec<(String, JoinHandle<()>)> = keys
            .into_iter()
            .filter_map(|key| self.draining.remove(&key))
            .collect();

        for (application, task) in handles {
            if let Err(e) = task.await {
                warn!(application = %application, error = %e, "Ticker task ended abnormally");
            }
            self.health
                .unregister(&components::detector(&application))
                .await;
        }

        self.workers.close();
        self.metrics.set_scheduled_items(0);
        self.health
            .set_unhealthy(components::SCHEDULER, "scheduler stopped")
            .await;
        info!(scheduler = %self.config.instance_name, "Scheduler stopped");
    }
}

/// Ticker loop for one item
async fn drive(
    item: Arc<dyn ScheduledItem>,
    previous: Option<JoinHandle<()>>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    health: HealthRegistry,
    metrics: RootsMetrics,
) {
    let application = item.application().to_string();
    let component = components::detector(&application);
    if let Some(previous) = previous {
        debug!(application = %application, "Waiting for cancelled ticker to drain");
        if let Err(e) = previous.await {
            warn!(application = %application, error = %e, "Ticker task ended abnormally");
        }
    }

    let mut ticker = interval(item.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let now = chrono::Utc::now().timestamp_millis();
        let started = Instant::now();
        let run_item = item.clone();
        let outcome = tokio::spawn(async move { run_item.run(now).await }).await;
        drop(permit);

        metrics.inc_detector_runs(&application);
        metrics.observe_run_latency(started.elapsed().as_secs_f64());

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                error!(
                    application = %application,
                    transient = e.is_transient(),
                    error = %e,
                    "Scheduled item failed"
                );
                Some(e.to_string())
            }
            Err(e) => {
                error!(application = %application, error = %e, "Scheduled item panicked");
                Some(format!("run panicked: {e}"))
            }
        };

        if failure.is_some() {
            metrics.inc_detector_failures(&application);
        }
        if cancel.is_cancelled() {
            break;
        }
        health.record_run(&component, now, failure).await;
    }
    debug!(application = %application, "Ticker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts firings and optionally sleeps, fails or panics
    struct MockItem {
        application: String,
        period: Duration,
        work: Duration,
        first_work: Option<Duration>,
        fail: bool,
        panic: bool,
        runs: AtomicUsize,
        finished: AtomicUsize,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl MockItem {
        fn new(application: &str, period_ms: u64) -> Self {
            Self {
                application: application.to_string(),
                period: Duration::from_millis(period_ms),
                work: Duration::ZERO,
                first_work: None,
                fail: false,
                panic: false,
                runs: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScheduledItem for MockItem {
        fn application(&self) -> &str {
            &self.application
        }

        fn period(&self) -> Duration {
            self.period
        }

        async fn run(&self, _now: i64) -> Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            let work = match (run, self.first_work) {
                (0, Some(first)) => first,
                _ => self.work,
            };
            if !work.is_zero() {
                tokio::time::sleep(work).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);

            if self.panic {
                panic!("boom");
            }
            if self.fail {
                return Err(RootsError::config("mock failure"));
            }
            Ok(())
        }
    }

    fn scheduler(threads: usize) -> SchedulerService {
        SchedulerService::new(
            SchedulerConfig {
                instance_name: "test".to_string(),
                thread_count: threads,
            },
            HealthRegistry::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_immediately_and_periodically() {
        let scheduler = scheduler(2);
        let item = Arc::new(MockItem::new("app1", 1000));
        scheduler.register(item.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(item.runs(), 1);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(item.runs(), 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_has_no_side_effect() {
        let scheduler = scheduler(2);
        let first = Arc::new(MockItem::new("app1", 1000));
        let second = Arc::new(MockItem::new("app1", 1000));

        scheduler.register(first.clone()).await.unwrap();
        let err = scheduler.register(second.clone()).await.unwrap_err();
        assert!(matches!(err, RootsError::DuplicateItem(ref app) if app == "app1"));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(first.runs(), 3);
        assert_eq!(second.runs(), 0);
        assert_eq!(scheduler.scheduled_applications(), vec!["app1".to_string()]);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_tick_does_not_burst() {
        let scheduler = scheduler(2);
        let mut item = MockItem::new("slow", 1000);
        item.first_work = Some(Duration::from_millis(3500));
        let item = Arc::new(item);
        scheduler.register(item.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5500)).await;
        let runs = item.runs();
        assert!((3..=4).contains(&runs), "unexpected run count {runs}");
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_bounds_concurrency() {
        let scheduler = scheduler(1);
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut items = Vec::new();
        for name in ["a", "b", "c"] {
            let mut item = MockItem::new(name, 1000);
            item.work = Duration::from_millis(200);
            item.active = active.clone();
            item.max_active = max_active.clone();
            items.push(Arc::new(item));
        }
        let scheduled = scheduler
            .start(items.iter().map(|i| i.clone() as Arc<dyn ScheduledItem>).collect())
            .await;
        assert_eq!(scheduled, 3);

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(items.iter().all(|i| i.runs() >= 2));
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_panics_are_contained() {
        let health = HealthRegistry::new();
        let scheduler = SchedulerService::new(SchedulerConfig::default(), health.clone());

        let mut failing = MockItem::new("failing", 1000);
        failing.fail = true;
        let mut panicking = MockItem::new("panicking", 1000);
        panicking.panic = true;
        let healthy = MockItem::new("healthy", 1000);

        let failing = Arc::new(failing);
        let panicking = Arc::new(panicking);
        let healthy = Arc::new(healthy);
        scheduler.register(failing.clone()).await.unwrap();
        scheduler.register(panicking.clone()).await.unwrap();
        scheduler.register(healthy.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(failing.runs(), 3);
        assert_eq!(panicking.runs(), 3);
        assert_eq!(healthy.runs(), 3);

        let report = health.health().await;
        let status = |name: &str| report.components[&components::detector(name)].status;
        assert_eq!(status("failing"), crate::health::ComponentStatus::Degraded);
        assert_eq!(status("panicking"), crate::health::ComponentStatus::Degraded);
        assert_eq!(status("healthy"), crate::health::ComponentStatus::Healthy);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_runs() {
        let scheduler = scheduler(2);
        let mut item = MockItem::new("app1", 10_000);
        item.work = Duration::from_millis(2000);
        let item = Arc::new(item);
        scheduler.register(item.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(item.runs(), 1);
        assert_eq!(item.finished.load(Ordering::SeqCst), 0);

        scheduler.stop().await;
        assert_eq!(item.finished.load(Ordering::SeqCst), 1);
        assert!(matches!(
            scheduler.register(Arc::new(MockItem::new("late", 1000))).await,
            Err(RootsError::SchedulerStopped(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_future_firings() {
        let scheduler = scheduler(2);
        let item = Arc::new(MockItem::new("app1", 1000));
        scheduler.register(item.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(item.runs(), 2);
        assert!(scheduler.cancel("app1").await);
        assert!(!scheduler.cancel("app1").await);

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(item.runs(), 2);

        // The application can be registered again once cancelled
        scheduler.register(item.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(item.runs(), 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_run_of_cancelled_item() {
        let scheduler = scheduler(2);
        let mut item = MockItem::new("app1", 10_000);
        item.work = Duration::from_millis(2000);
        let item = Arc::new(item);
        scheduler.register(item.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.cancel("app1").await);
        assert!(!scheduler.is_scheduled("app1"));
        assert_eq!(item.finished.load(Ordering::SeqCst), 0);

        scheduler.stop().await;
        assert_eq!(item.runs(), 1);
        assert_eq!(item.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_waits_for_cancelled_run() {
        let scheduler = scheduler(2);
        let mut item = MockItem::new("app1", 10_000);
        item.work = Duration::from_millis(2000);
        let item = Arc::new(item);
        scheduler.register(item.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.cancel("app1").await);
        scheduler.register(item.clone()).await.unwrap();
        assert!(scheduler.is_scheduled("app1"));

        // The replacement fires only once the cancelled run has returned
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(item.runs(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(item.runs(), 2);
        assert_eq!(item.max_active.load(Ordering::SeqCst), 1);

        scheduler.stop().await;
        assert_eq!(item.finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_are_recorded_in_health() {
        let health = HealthRegistry::new();
        let scheduler = SchedulerService::new(SchedulerConfig::default(), health.clone());
        let mut failing = MockItem::new("failing", 1000);
        failing.fail = true;
        scheduler.register(Arc::new(failing)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let state = health
            .run_state(&components::detector("failing"))
            .await
            .unwrap();
        assert_eq!(state.runs, 3);
        assert_eq!(state.consecutive_failures, 3);
        assert!(state.last_run.is_some());
        assert!(state.last_success.is_none());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_zero_period_rejected() {
        let scheduler = scheduler(1);
        let item = Arc::new(MockItem::new("app1", 0));
        assert!(matches!(
            scheduler.register(item).await,
            Err(RootsError::Config(_))
        ));
        assert!(!scheduler.is_scheduled("app1"));
    }
}
