//! Agent configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use roots_lib::config::Properties;
use roots_lib::scheduler::{SchedulerConfig, DEFAULT_THREAD_COUNT};
use roots_lib::stats::{StatsEngineConfig, DEFAULT_BORROW_TIMEOUT, DEFAULT_POOL_SIZE};
use roots_lib::DetectorConfig;
use serde::Deserialize;

/// Config file read when `ROOTS_CONFIG` is not set
pub const DEFAULT_CONFIG_PATH: &str = "roots.toml";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub stats: StatsSection,

    /// Bound on every metrics store call, in seconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,

    /// Global properties such as `bi.finders` and `workload.analyzer`
    #[serde(default)]
    pub properties: Properties,

    #[serde(default)]
    pub data_stores: Vec<DataStoreConfig>,

    #[serde(default)]
    pub detectors: Vec<DetectorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            thread_count: default_thread_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsSection {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_borrow_timeout")]
    pub borrow_timeout_secs: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            borrow_timeout_secs: default_borrow_timeout(),
        }
    }
}

/// A named metrics store, optionally seeded from a JSON snapshot
#[derive(Debug, Clone, Deserialize)]
pub struct DataStoreConfig {
    pub name: String,
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
}

fn default_api_port() -> u16 {
    8080
}

fn default_store_timeout() -> u64 {
    30
}

fn default_instance_name() -> String {
    SchedulerConfig::default().instance_name
}

fn default_thread_count() -> usize {
    DEFAULT_THREAD_COUNT
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_borrow_timeout() -> u64 {
    DEFAULT_BORROW_TIMEOUT.as_secs()
}

impl AgentConfig {
    /// Load configuration from the config file and `ROOTS_*` environment variables
    pub fn load() -> Result<Self> {
        let path = std::env::var("ROOTS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load from `path` (optional) overlaid with the environment
    pub fn load_from(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("ROOTS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {path}"))?;

        config
            .try_deserialize()
            .with_context(|| format!("invalid configuration in {path}"))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            instance_name: self.scheduler.instance_name.clone(),
            thread_count: self.scheduler.thread_count,
        }
    }

    pub fn stats_config(&self) -> StatsEngineConfig {
        StatsEngineConfig {
            pool_size: self.stats.pool_size,
            borrow_timeout: Duration::from_secs(self.stats.borrow_timeout_secs),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}
