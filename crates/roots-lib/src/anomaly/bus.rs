//! Publish/subscribe distribution of anomalies
//!
//! Subscribers are invoked one after another, each in its own task so that an error
//! or a panic stays with the subscriber that raised it. `publish` returns only after
//! every subscriber registered at publish time has been invoked.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::Anomaly;
use crate::error::Result;
use crate::observability::RootsMetrics;

/// Receives every anomaly published on the bus
#[async_trait]
pub trait AnomalySubscriber: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn on_anomaly(&self, anomaly: Arc<Anomaly>) -> Result<()>;
}

/// Outcome of delivering one anomaly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Handle to the shared subscriber registry; clones publish to the same subscribers
#[derive(Clone, Default)]
pub struct AnomalyBus {
    subscribers: Arc<RwLock<Vec<Arc<dyn AnomalySubscriber>>>>,
    metrics: RootsMetrics,
}

impl AnomalyBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn AnomalySubscriber>) {
        info!(subscriber = %subscriber.name(), "Registered anomaly subscriber");
        self.subscribers.write().await.push(subscriber);
    }

    /// Remove every subscriber registered under `name`
    pub async fn unsubscribe(&self, name: &str) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.name() != name);
        subscribers.len() != before
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn clear(&self) {
        self.subscribers.write().await.clear();
    }

    /// Deliver an anomaly to every current subscriber
    pub async fn publish(&self, anomaly: Anomaly) -> Delivery {
        let anomaly = Arc::new(anomaly);
        let subscribers: Vec<Arc<dyn AnomalySubscriber>> =
            self.subscribers.read().await.iter().cloned().collect();
        self.metrics
            .inc_anomalies_published(&anomaly.anomaly_type.to_string());
        debug!(
            anomaly_id = %anomaly.id,
            subscribers = subscribers.len(),
            "Publishing anomaly"
        );

        let mut delivery = Delivery::default();
        for subscriber in subscribers {
            let name = subscriber.name().to_string();
            let started = Instant::now();
            let event = anomaly.clone();
            let outcome = tokio::spawn(async move { subscriber.on_anomaly(event).await }).await;
            self.metrics
                .observe_diagnosis_latency(&name, started.elapsed().as_secs_f64());

            match outcome {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(e)) => {
                    delivery.failed += 1;
                    self.metrics.inc_subscriber_failures(&name);
                    error!(
                        subscriber = %name,
                        anomaly_id = %anomaly.id,
                        error = %e,
                        "Anomaly subscriber failed"
                    );
                }
                Err(e) => {
                    delivery.failed += 1;
                    self.metrics.inc_subscriber_failures(&name);
                    error!(
                        subscriber = %name,
                        anomaly_id = %anomaly.id,
                        error = %e,
                        "Anomaly subscriber panicked"
                    );
                }
            }
        }
        delivery
    }
}
