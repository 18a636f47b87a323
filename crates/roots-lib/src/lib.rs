//! Roots: SLO anomaly detection and diagnosis for hosted web applications
//!
//! This crate provides the core functionality for:
//! - Periodic SLO-based anomaly detection over benchmark data
//! - Anomaly distribution to diagnosis subscribers
//! - Bottleneck identification across internal API calls
//! - Workload change analysis
//! - Health checks and observability

pub mod anomaly;
pub mod bottleneck;
pub mod changepoint;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod workload;

pub use anomaly::{Anomaly, AnomalyBus, AnomalyDetector, AnomalySubscriber, AnomalyType, DetectorConfig};
pub use context::RootsContext;
pub use error::{DataStoreError, Result, RootsError, StatsError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse, RunState,
};
pub use models::*;
pub use observability::{AnomalyLog, RootsMetrics};
pub use scheduler::{ScheduledItem, SchedulerConfig, SchedulerService};
