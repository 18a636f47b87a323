//! Roots agent: configuration loading and the health/metrics HTTP surface

pub mod api;
pub mod config;
