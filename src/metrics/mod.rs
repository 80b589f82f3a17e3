//! Windowed per-gateway metrics.
//!
//! Every operation outcome lands here as a `MetricSample` in a bounded
//! sliding window (sample-count cap and time horizon, oldest evicted first).
//! Derived statistics are computed on demand over the current window, and
//! each appended sample is pushed to registered observers together with the
//! post-append stats - the alert engine subscribes this way.

pub mod collector;

pub use collector::{GatewayStats, MetricObserver, MetricSample, MetricsCollector};
