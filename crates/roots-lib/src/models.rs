//! Core data models for the detection pipeline
//!
//! All timestamps are milliseconds since the Unix epoch.

use serde::{Deserialize, Serialize};

/// One synthetic benchmark probe against an application operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkResult {
    pub timestamp: i64,
    pub application: String,
    pub method: String,
    pub path: String,
    /// Response time in milliseconds
    pub response_time: u64,
}

impl BenchmarkResult {
    pub fn new(
        timestamp: i64,
        application: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        response_time: u64,
    ) -> Self {
        Self {
            timestamp,
            application: application.into(),
            method: method.into(),
            path: path.into(),
            response_time,
        }
    }

    /// Operation key, e.g. `"GET /x"`
    pub fn operation(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// One request observed in an application's access log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub request_id: String,
    pub timestamp: i64,
    pub application: String,
    pub method: String,
    pub path: String,
    pub response_time: u64,
}

impl AccessLogEntry {
    pub fn operation(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// A single internal (cloud SDK) call made while serving a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCall {
    pub service: String,
    pub operation: String,
    /// Elapsed time in milliseconds
    pub time_elapsed: u64,
}

impl ApiCall {
    pub fn new(service: impl Into<String>, operation: impl Into<String>, time_elapsed: u64) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            time_elapsed,
        }
    }

    /// Call name used in path signatures and reports
    pub fn name(&self) -> String {
        format!("{}:{}", self.service, self.operation)
    }
}

/// One application request together with its ordered chain of internal calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRequest {
    pub request_id: String,
    pub timestamp: i64,
    pub application: String,
    pub operation: String,
    /// Calls in sequence-number order
    pub api_calls: Vec<ApiCall>,
    pub response_time: u64,
}

impl ApplicationRequest {
    /// Call-path signature: ordered call names joined with `", "`
    pub fn path_as_string(&self) -> String {
        self.api_calls
            .iter()
            .map(ApiCall::name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Per-call elapsed times followed by the total response time
    pub fn response_time_vector(&self) -> Vec<f64> {
        let mut vector: Vec<f64> = self
            .api_calls
            .iter()
            .map(|c| c.time_elapsed as f64)
            .collect();
        vector.push(self.response_time as f64);
        vector
    }
}

/// Aggregate response time for one operation over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTimeSummary {
    /// Start of the window (or bucket) the summary covers
    pub timestamp: i64,
    pub mean_response_time: f64,
    pub request_count: u64,
}
