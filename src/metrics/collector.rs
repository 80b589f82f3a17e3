use dashmap::DashMap;
use log::error;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::utils::now_millis;

/// One observation for one gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricSample {
    Latency { ms: f64, ts: u64 },
    OrderResult { success: bool, ts: u64 },
    Error { kind: String, message: String, ts: u64 },
    Connection { connected: bool, ts: u64 },
}

impl MetricSample {
    pub fn ts(&self) -> u64 {
        match self {
            MetricSample::Latency { ts, .. }
            | MetricSample::OrderResult { ts, .. }
            | MetricSample::Error { ts, .. }
            | MetricSample::Connection { ts, .. } => *ts,
        }
    }
}

/// Statistics derived from one gateway's current window.
///
/// Rates are percentages so rule thresholds read naturally
/// ("success rate < 95"). With no evidence in the window, success rate and
/// uptime default to 100 and error rate to 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStats {
    pub samples: usize,
    pub latency_samples: usize,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub uptime: f64,
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self {
            samples: 0,
            latency_samples: 0,
            avg_latency_ms: 0.0,
            min_latency_ms: 0.0,
            max_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            p99_latency_ms: 0.0,
            success_rate: 100.0,
            error_rate: 0.0,
            uptime: 100.0,
        }
    }
}

/// Receives every appended sample plus the stats computed just after the
/// append. A panicking observer is isolated and logged.
pub trait MetricObserver: Send + Sync {
    fn on_sample(&self, gateway: &str, sample: &MetricSample, stats: &GatewayStats);
}

/// Percentile per the window contract: value at index ⌊n·p⌋ of the sorted
/// sample copy, clamped to the last element.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * p) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

pub struct MetricsCollector {
    windows: DashMap<String, Mutex<VecDeque<MetricSample>>>,
    max_samples: usize,
    horizon: Duration,
    observers: RwLock<Vec<Arc<dyn MetricObserver>>>,
}

impl MetricsCollector {
    pub fn new(max_samples: usize, horizon: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_samples: max_samples.max(1),
            horizon,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn attach_observer(&self, observer: Arc<dyn MetricObserver>) {
        self.observers
            .write()
            .expect("metric observer lock poisoned")
            .push(observer);
    }

    pub fn record_latency(&self, gateway: &str, ms: f64) {
        self.push(gateway, MetricSample::Latency { ms, ts: now_millis() });
    }

    pub fn record_order_result(&self, gateway: &str, success: bool) {
        self.push(gateway, MetricSample::OrderResult { success, ts: now_millis() });
    }

    pub fn record_error(&self, gateway: &str, kind: &str, message: impl Into<String>) {
        self.push(
            gateway,
            MetricSample::Error {
                kind: kind.to_string(),
                message: message.into(),
                ts: now_millis(),
            },
        );
    }

    pub fn record_connection_status(&self, gateway: &str, connected: bool) {
        self.push(gateway, MetricSample::Connection { connected, ts: now_millis() });
    }

    /// Stats over the gateway's current window. Unknown gateways get the
    /// neutral defaults rather than an error.
    pub fn stats(&self, gateway: &str) -> GatewayStats {
        match self.windows.get(gateway) {
            Some(window) => {
                let deque = window.lock().expect("metrics window lock poisoned");
                Self::compute(&deque)
            }
            None => GatewayStats::default(),
        }
    }

    pub fn all_stats(&self) -> HashMap<String, GatewayStats> {
        self.windows
            .iter()
            .map(|entry| {
                let deque = entry.value().lock().expect("metrics window lock poisoned");
                (entry.key().clone(), Self::compute(&deque))
            })
            .collect()
    }

    /// Number of samples currently held for a gateway.
    pub fn window_len(&self, gateway: &str) -> usize {
        self.windows
            .get(gateway)
            .map(|w| w.lock().expect("metrics window lock poisoned").len())
            .unwrap_or(0)
    }

    /// Drop a gateway's window, e.g. after an external reset.
    pub fn clear(&self, gateway: &str) {
        self.windows.remove(gateway);
    }

    fn push(&self, gateway: &str, sample: MetricSample) {
        let stats = {
            let window = self
                .windows
                .entry(gateway.to_string())
                .or_insert_with(|| Mutex::new(VecDeque::new()));
            let mut deque = window.lock().expect("metrics window lock poisoned");

            deque.push_back(sample.clone());
            while deque.len() > self.max_samples {
                deque.pop_front();
            }
            let cutoff = now_millis().saturating_sub(self.horizon.as_millis() as u64);
            while deque.front().map(|s| s.ts() < cutoff).unwrap_or(false) {
                deque.pop_front();
            }

            Self::compute(&deque)
        };

        // Observers run outside the window lock so a slow observer cannot
        // stall recording from other tasks.
        let observers = self
            .observers
            .read()
            .expect("metric observer lock poisoned")
            .clone();
        for observer in observers {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| observer.on_sample(gateway, &sample, &stats)));
            if outcome.is_err() {
                error!("Handler Error: metric observer panicked on sample for '{}'", gateway);
            }
        }
    }

    fn compute(deque: &VecDeque<MetricSample>) -> GatewayStats {
        let mut latencies: Vec<f64> = Vec::new();
        let mut order_successes = 0usize;
        let mut order_failures = 0usize;
        let mut errors = 0usize;
        let mut conn_up = 0usize;
        let mut conn_total = 0usize;

        for sample in deque {
            match sample {
                MetricSample::Latency { ms, .. } => latencies.push(*ms),
                MetricSample::OrderResult { success, .. } => {
                    if *success {
                        order_successes += 1;
                    } else {
                        order_failures += 1;
                    }
                }
                MetricSample::Error { .. } => errors += 1,
                MetricSample::Connection { connected, .. } => {
                    conn_total += 1;
                    if *connected {
                        conn_up += 1;
                    }
                }
            }
        }

        let mut stats = GatewayStats {
            samples: deque.len(),
            latency_samples: latencies.len(),
            ..Default::default()
        };

        if !latencies.is_empty() {
            let sum: f64 = latencies.iter().sum();
            stats.avg_latency_ms = sum / latencies.len() as f64;
            let mut sorted = latencies;
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            stats.min_latency_ms = sorted[0];
            stats.max_latency_ms = sorted[sorted.len() - 1];
            stats.p95_latency_ms = percentile(&sorted, 0.95);
            stats.p99_latency_ms = percentile(&sorted, 0.99);
        }

        let order_total = order_successes + order_failures;
        if order_total > 0 {
            stats.success_rate = 100.0 * order_successes as f64 / order_total as f64;
        }
        if order_total + errors > 0 {
            stats.error_rate = 100.0 * errors as f64 / (order_total + errors) as f64;
        }
        if conn_total > 0 {
            stats.uptime = 100.0 * conn_up as f64 / conn_total as f64;
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collector() -> MetricsCollector {
        MetricsCollector::new(1000, Duration::from_secs(300))
    }

    #[test]
    fn test_latency_percentiles() {
        let c = collector();
        for ms in [50.0, 60.0, 70.0, 80.0, 90.0] {
            c.record_latency("gw-x", ms);
        }
        let stats = c.stats("gw-x");
        assert_approx_eq!(stats.avg_latency_ms, 70.0);
        assert_approx_eq!(stats.min_latency_ms, 50.0);
        assert_approx_eq!(stats.max_latency_ms, 90.0);
        // index floor(5 * 0.95) = 4 of the sorted copy
        assert_approx_eq!(stats.p95_latency_ms, 90.0);
        assert_approx_eq!(stats.p99_latency_ms, 90.0);
    }

    #[test]
    fn test_success_rate_nine_of_ten() {
        let c = collector();
        for _ in 0..9 {
            c.record_order_result("gw-x", true);
        }
        c.record_order_result("gw-x", false);
        assert_approx_eq!(c.stats("gw-x").success_rate, 90.0);
    }

    #[test]
    fn test_neutral_defaults_without_samples() {
        let c = collector();
        let stats = c.stats("never-seen");
        assert_approx_eq!(stats.success_rate, 100.0);
        assert_approx_eq!(stats.error_rate, 0.0);
        assert_approx_eq!(stats.uptime, 100.0);
        assert_eq!(stats.samples, 0);
    }

    #[test]
    fn test_window_sample_cap_evicts_oldest() {
        let c = MetricsCollector::new(3, Duration::from_secs(300));
        for ms in [10.0, 20.0, 30.0, 40.0] {
            c.record_latency("gw-x", ms);
        }
        let stats = c.stats("gw-x");
        assert_eq!(stats.latency_samples, 3);
        assert_approx_eq!(stats.min_latency_ms, 20.0);
        assert_approx_eq!(stats.max_latency_ms, 40.0);
    }

    #[test]
    fn test_error_rate_and_uptime() {
        let c = collector();
        c.record_order_result("gw-x", true);
        c.record_error("gw-x", "timeout", "submit_order timed out");
        assert_approx_eq!(c.stats("gw-x").error_rate, 50.0);

        c.record_connection_status("gw-x", true);
        c.record_connection_status("gw-x", false);
        assert_approx_eq!(c.stats("gw-x").uptime, 50.0);
    }

    #[test]
    fn test_observer_sees_post_append_stats_and_panics_are_isolated() {
        struct Counting(AtomicUsize);
        impl MetricObserver for Counting {
            fn on_sample(&self, _gateway: &str, _sample: &MetricSample, stats: &GatewayStats) {
                assert!(stats.samples > 0);
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        struct Exploding;
        impl MetricObserver for Exploding {
            fn on_sample(&self, _: &str, _: &MetricSample, _: &GatewayStats) {
                panic!("observer bug");
            }
        }

        let c = collector();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        c.attach_observer(Arc::new(Exploding));
        c.attach_observer(Arc::clone(&counting) as Arc<dyn MetricObserver>);

        c.record_latency("gw-x", 12.0);
        c.record_order_result("gw-x", true);

        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clear_resets_window() {
        let c = collector();
        c.record_latency("gw-x", 5.0);
        assert_eq!(c.window_len("gw-x"), 1);
        c.clear("gw-x");
        assert_eq!(c.window_len("gw-x"), 0);
    }
}
