use std::env;
use std::time::Duration;

/// Process-level tuning knobs. Gateway descriptors and alert rules are
/// supplied programmatically at `initialize()`; these settings cover the
/// timeouts, cadences and window sizes shared by every component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub order_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub default_connect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub fanout_concurrency: usize,
    pub metrics_window_samples: usize,
    pub metrics_window_secs: u64,
    pub alert_history_limit: usize,
    pub bus_stop_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            order_timeout_ms: 5_000,
            query_timeout_ms: 10_000,
            default_connect_timeout_ms: 10_000,
            reconnect_interval_ms: 5_000,
            heartbeat_interval_ms: 15_000,
            max_reconnect_attempts: 5,
            fanout_concurrency: 8,
            metrics_window_samples: 1_000,
            metrics_window_secs: 300,
            alert_history_limit: 1_000,
            bus_stop_timeout_ms: 2_000,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();
        Settings {
            order_timeout_ms: env_u64("ORDER_TIMEOUT_MS", d.order_timeout_ms),
            query_timeout_ms: env_u64("QUERY_TIMEOUT_MS", d.query_timeout_ms),
            default_connect_timeout_ms: env_u64(
                "CONNECT_TIMEOUT_MS",
                d.default_connect_timeout_ms,
            ),
            reconnect_interval_ms: env_u64("RECONNECT_INTERVAL_MS", d.reconnect_interval_ms),
            heartbeat_interval_ms: env_u64("HEARTBEAT_INTERVAL_MS", d.heartbeat_interval_ms),
            max_reconnect_attempts: env_u64("MAX_RECONNECT_ATTEMPTS", d.max_reconnect_attempts as u64)
                as u32,
            fanout_concurrency: env_usize("FANOUT_CONCURRENCY", d.fanout_concurrency),
            metrics_window_samples: env_usize("METRICS_WINDOW_SAMPLES", d.metrics_window_samples),
            metrics_window_secs: env_u64("METRICS_WINDOW_SECS", d.metrics_window_secs),
            alert_history_limit: env_usize("ALERT_HISTORY_LIMIT", d.alert_history_limit),
            bus_stop_timeout_ms: env_u64("BUS_STOP_TIMEOUT_MS", d.bus_stop_timeout_ms),
        }
    }

    pub fn validate_and_log(&self) {
        log::info!("Gateway hub configuration loaded: {:?}", self);
        if self.fanout_concurrency == 0 {
            log::error!("FANOUT_CONCURRENCY cannot be 0; fan-out operations would deadlock.");
        }
        if self.metrics_window_samples == 0 {
            log::error!("METRICS_WINDOW_SAMPLES cannot be 0; no stats would ever accumulate.");
        }
        if self.reconnect_interval_ms < 100 {
            log::warn!(
                "RECONNECT_INTERVAL_MS={} is very aggressive; backends may throttle reconnects",
                self.reconnect_interval_ms
            );
        }
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn default_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.default_connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn metrics_horizon(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }

    pub fn bus_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.order_timeout(), Duration::from_secs(5));
        assert_eq!(s.metrics_window_samples, 1_000);
        assert_eq!(s.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_env_override() {
        env::set_var("ORDER_TIMEOUT_MS", "1234");
        let s = Settings::from_env();
        assert_eq!(s.order_timeout_ms, 1234);
        env::remove_var("ORDER_TIMEOUT_MS");
    }

    #[test]
    fn test_bad_env_falls_back_to_default() {
        env::set_var("QUERY_TIMEOUT_MS", "not-a-number");
        let s = Settings::from_env();
        assert_eq!(s.query_timeout_ms, Settings::default().query_timeout_ms);
        env::remove_var("QUERY_TIMEOUT_MS");
    }
}
