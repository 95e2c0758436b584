//! Lightweight in-process metrics.
//!
//! Metrics are stored as atomics behind `DashMap` label maps and rendered in
//! Prometheus text format by the `/metrics` handler.

pub mod metrics;

pub use metrics::AgentMetrics;
