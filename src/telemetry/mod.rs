//! Execution metrics for the worker pool.
//!
//! With the `telemetry` feature the pool records task counts and a latency
//! histogram. Without it the same API compiles to no-ops.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self {
            Self
        }
        pub fn record_task_execution(&self, _: u64) {}
        pub fn record_task_stolen(&self) {}
        pub fn record_task_panic(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MetricsSnapshot {
        pub timestamp: Option<Instant>,
        pub uptime: Duration,
        pub tasks_executed: u64,
        pub tasks_stolen: u64,
        pub tasks_panicked: u64,
        pub avg_latency_ns: u64,
        pub p50_latency_ns: u64,
        pub p95_latency_ns: u64,
        pub p99_latency_ns: u64,
        pub max_latency_ns: u64,
    }

    impl MetricsSnapshot {
        pub fn tasks_per_second(&self) -> f64 {
            0.0
        }
    }
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
