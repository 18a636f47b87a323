//! Shared configuration primitives
//!
//! - `Properties`: string key/value settings with typed lookups
//! - Time-delta parsing for human-friendly durations (`"1h30m"`)

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, RootsError};

/// Comma-separated list of bottleneck finder names
pub const BI_FINDERS: &str = "bi.finders";
/// PELT penalty used by the relative importance finder
pub const BI_PELT_PENALTY: &str = "bi.pelt.penalty";
/// Percentile used by the percentile finder
pub const BI_PERCENTILE: &str = "bi.percentile";
/// Change point detector used by the workload analyzer
pub const WORKLOAD_ANALYZER: &str = "workload.analyzer";

/// String properties attached to the environment or to a single detector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(HashMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Parse a property, failing with a configuration error on malformed values
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                RootsError::config(format!("invalid value for property {key}: {raw:?}"))
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, String>> for Properties {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

/// Resolve a property from a detector's own properties first, then the environment
pub fn resolve_property<'a>(
    detector: &'a Properties,
    environment: &'a Properties,
    key: &str,
) -> Option<&'a str> {
    detector.get(key).or_else(|| environment.get(key))
}

/// Parse a time delta such as `"90s"`, `"15m"`, `"1h30m"` or `"2d"` into seconds
///
/// A bare integer is taken as seconds.
pub fn parse_time_delta(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(RootsError::config("empty time delta"));
    }
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Ok(seconds);
    }

    let invalid = || RootsError::config(format!("invalid time delta: {input:?}"));
    let mut total: u64 = 0;
    let mut digits = String::new();
    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if ch.is_whitespace() {
            if digits.is_empty() {
                continue;
            }
            return Err(invalid());
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            _ => return Err(invalid()),
        };
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(total)
}

/// Serde helper accepting either an integer number of seconds or a time-delta string
pub fn deserialize_seconds<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Delta(String),
    }

    let seconds = match Raw::deserialize(deserializer)? {
        Raw::Seconds(s) => s,
        Raw::Delta(s) => parse_time_delta(&s).map_err(serde::de::Error::custom)?,
    };
    u32::try_from(seconds).map_err(|_| serde::de::Error::custom("duration out of range"))
}
