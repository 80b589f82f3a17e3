//! Per-gateway reconnection and heartbeat loops.
//!
//! Each supervised gateway gets two small background tasks: a reconnect loop
//! that re-attempts `connect()` on a fixed interval while the gateway is
//! unhealthy and under its error budget, and a heartbeat loop that refreshes
//! `last_heartbeat` and probes adapter liveness for connected gateways.
//! Reconnection failures are never raised to callers - they show up only in
//! `GatewayStatus` and through alerts on the recorded metrics.

use log::{debug, info, warn};
use rand::Rng;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::events::{Event, EventBus, EventKind};
use crate::gateway::{GatewayDescriptor, GatewayHandle, GatewayStatus};
use crate::metrics::MetricsCollector;
use crate::utils::now_millis;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            max_reconnect_attempts: 5,
        }
    }
}

/// Shared per-gateway state handed to the supervisor by the orchestrator.
#[derive(Clone)]
pub struct SupervisedGateway {
    pub descriptor: GatewayDescriptor,
    pub handle: Arc<dyn GatewayHandle>,
    pub status: Arc<RwLock<GatewayStatus>>,
}

pub struct ConnectionHealthSupervisor {
    config: SupervisorConfig,
    gateways: Vec<SupervisedGateway>,
    collector: Arc<MetricsCollector>,
    bus: Arc<EventBus>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionHealthSupervisor {
    pub fn new(
        config: SupervisorConfig,
        gateways: Vec<SupervisedGateway>,
        collector: Arc<MetricsCollector>,
        bus: Arc<EventBus>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            gateways,
            collector,
            bus,
            shutdown,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the reconnect + heartbeat pair for every supervised gateway.
    /// No-op when already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Supervisor already running");
            return;
        }
        let _ = self.shutdown.send(false);

        let mut tasks = self.tasks.lock().expect("supervisor task lock poisoned");
        for gateway in &self.gateways {
            tasks.push(tokio::spawn(Self::reconnect_loop(
                gateway.clone(),
                self.config.clone(),
                Arc::clone(&self.collector),
                Arc::clone(&self.bus),
                self.shutdown.subscribe(),
            )));
            tasks.push(tokio::spawn(Self::heartbeat_loop(
                gateway.clone(),
                self.config.clone(),
                Arc::clone(&self.collector),
                Arc::clone(&self.bus),
                self.shutdown.subscribe(),
            )));
        }
        info!(
            "🚀 Connection supervisor started for {} gateway(s)",
            self.gateways.len()
        );
    }

    /// Cancel all loops. Bounded: every task either observes the shutdown
    /// signal within one tick or is aborted. Safe to call repeatedly and
    /// concurrently with connect/disconnect fan-outs.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Supervisor already stopped");
            return;
        }
        let _ = self.shutdown.send(true);

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().expect("supervisor task lock poisoned");
            guard.drain(..).collect()
        };

        let grace = self.config.reconnect_interval.max(self.config.heartbeat_interval)
            + Duration::from_millis(250);
        for task in tasks {
            let abort = task.abort_handle();
            if timeout(grace, task).await.is_err() {
                abort.abort();
                warn!("⚠️ Supervisor task did not stop within {:?}, aborting", grace);
            }
        }
        info!("🛑 Connection supervisor stopped");
    }

    async fn reconnect_loop(
        gateway: SupervisedGateway,
        config: SupervisorConfig,
        collector: Arc<MetricsCollector>,
        bus: Arc<EventBus>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let name = gateway.descriptor.name.clone();
        let mut ticker = interval(config.reconnect_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so a freshly failed connect
        // is not retried with zero delay.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (connected, error_count) = {
                        let status = gateway.status.read().await;
                        (status.connected, status.error_count)
                    };
                    if connected {
                        continue;
                    }
                    if error_count >= config.max_reconnect_attempts {
                        // Terminal: wait for an explicit external reset.
                        continue;
                    }

                    // Small jitter so N gateways reconnecting to one backend
                    // do not fire in lockstep.
                    let jitter_cap = (config.reconnect_interval.as_millis() as u64 / 10).max(1);
                    let jitter = rand::thread_rng().gen_range(0..jitter_cap);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;

                    Self::attempt_reconnect(&gateway, &config, &collector, &bus).await;
                }
                changed = shutdown.changed() => {
                    // A dropped sender means the supervisor is gone; exit too.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Reconnect loop for '{}' shutting down", name);
                        break;
                    }
                }
            }
        }
    }

    async fn attempt_reconnect(
        gateway: &SupervisedGateway,
        config: &SupervisorConfig,
        collector: &Arc<MetricsCollector>,
        bus: &Arc<EventBus>,
    ) {
        let name = gateway.descriptor.name.clone();
        debug!("📡 Supervisor reconnecting gateway '{}'...", name);

        let result = timeout(
            gateway.descriptor.connection_timeout(),
            gateway.handle.connect(),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                {
                    let mut status = gateway.status.write().await;
                    status.connected = true;
                    status.error_count = 0;
                    status.last_error = None;
                    status.last_connect_time = Some(now_millis());
                }
                collector.record_connection_status(&name, true);
                let _ = bus.publish(Event::new(
                    EventKind::Connect,
                    name.clone(),
                    json!({ "source": "supervisor" }),
                ));
                info!("✅ Supervisor reconnected gateway '{}'", name);
            }
            Ok(Err(e)) => {
                Self::record_reconnect_failure(gateway, config, collector, &e.to_string()).await;
            }
            Err(_) => {
                let msg = format!(
                    "reconnect timed out after {:?}",
                    gateway.descriptor.connection_timeout()
                );
                Self::record_reconnect_failure(gateway, config, collector, &msg).await;
            }
        }
    }

    async fn record_reconnect_failure(
        gateway: &SupervisedGateway,
        config: &SupervisorConfig,
        collector: &Arc<MetricsCollector>,
        reason: &str,
    ) {
        let name = &gateway.descriptor.name;
        let error_count = {
            let mut status = gateway.status.write().await;
            status.error_count = status.error_count.saturating_add(1);
            status.last_error = Some(reason.to_string());
            status.error_count
        };
        collector.record_error(name, "connection", reason);

        if error_count >= config.max_reconnect_attempts {
            warn!(
                "🛑 Gateway '{}' reached {} failed reconnect attempts; giving up until reset",
                name, error_count
            );
        } else {
            warn!(
                "⚠️ Reconnect attempt {}/{} for gateway '{}' failed: {}",
                error_count, config.max_reconnect_attempts, name, reason
            );
        }
    }

    async fn heartbeat_loop(
        gateway: SupervisedGateway,
        config: SupervisorConfig,
        collector: Arc<MetricsCollector>,
        bus: Arc<EventBus>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let name = gateway.descriptor.name.clone();
        let mut ticker = interval(config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let connected = gateway.status.read().await.connected;
                    if !connected {
                        continue;
                    }

                    // Best-effort liveness: the adapter's own view of the
                    // link. A silently dropped session is surfaced here.
                    if gateway.handle.is_connected() {
                        let mut status = gateway.status.write().await;
                        status.last_heartbeat = Some(now_millis());
                    } else {
                        warn!("💔 Heartbeat lost for gateway '{}'", name);
                        {
                            let mut status = gateway.status.write().await;
                            status.connected = false;
                            status.last_disconnect_time = Some(now_millis());
                            status.last_error = Some("heartbeat lost".to_string());
                        }
                        collector.record_connection_status(&name, false);
                        let _ = bus.publish(Event::new(
                            EventKind::Disconnect,
                            name.clone(),
                            json!({ "source": "heartbeat" }),
                        ));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Heartbeat loop for '{}' shutting down", name);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockGateway, MockGatewayConfig};
    use pretty_assertions::assert_eq;

    fn test_config(interval_ms: u64) -> SupervisorConfig {
        SupervisorConfig {
            reconnect_interval: Duration::from_millis(interval_ms),
            heartbeat_interval: Duration::from_millis(interval_ms),
            max_reconnect_attempts: 3,
        }
    }

    fn supervised(handle: Arc<MockGateway>) -> SupervisedGateway {
        let descriptor = GatewayDescriptor::new(handle.name().to_string(), handle.backend())
            .with_connection_timeout_ms(500);
        SupervisedGateway {
            descriptor,
            handle: handle as Arc<dyn GatewayHandle>,
            status: Arc::new(RwLock::new(GatewayStatus::default())),
        }
    }

    fn harness(
        gateways: Vec<SupervisedGateway>,
        interval_ms: u64,
    ) -> (ConnectionHealthSupervisor, Arc<EventBus>) {
        let collector = Arc::new(MetricsCollector::new(100, Duration::from_secs(60)));
        let bus = Arc::new(EventBus::new(Duration::from_millis(500)));
        bus.start();
        let supervisor = ConnectionHealthSupervisor::new(
            test_config(interval_ms),
            gateways,
            collector,
            Arc::clone(&bus),
        );
        (supervisor, bus)
    }

    #[tokio::test]
    async fn test_reconnects_unhealthy_gateway_and_resets_error_count() {
        let mock = MockGateway::named("gw-a", MockGatewayConfig::default());
        let gateway = supervised(Arc::clone(&mock));
        gateway.status.write().await.error_count = 2; // under the cap

        let (supervisor, bus) = harness(vec![gateway.clone()], 30);
        supervisor.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        supervisor.stop().await;
        bus.stop().await;

        let status = gateway.status.read().await;
        assert!(status.connected);
        assert_eq!(status.error_count, 0);
        assert!(status.last_connect_time.is_some());
    }

    #[tokio::test]
    async fn test_terminal_after_max_attempts() {
        let mock = MockGateway::named(
            "gw-b",
            MockGatewayConfig {
                connect_failures_before_success: u32::MAX, // never connects
                ..Default::default()
            },
        );
        let attempts_probe = Arc::clone(&mock);
        let gateway = supervised(mock);

        let (supervisor, bus) = harness(vec![gateway.clone()], 25);
        supervisor.start();
        tokio::time::sleep(Duration::from_millis(500)).await;

        {
            let status = gateway.status.read().await;
            assert!(!status.connected);
            assert_eq!(status.error_count, 3); // saturated at the cap
            assert!(status.is_terminal(3));
        }
        let attempts_at_cap = attempts_probe.connect_attempts();

        // More ticks pass; no further automatic attempts are made.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(attempts_probe.connect_attempts(), attempts_at_cap);

        supervisor.stop().await;
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_and_detects_silent_drop() {
        let mock = MockGateway::named("gw-c", MockGatewayConfig::default());
        let gateway = supervised(Arc::clone(&mock));
        mock.connect().await.unwrap();
        gateway.status.write().await.connected = true;

        let (supervisor, bus) = harness(vec![gateway.clone()], 25);
        supervisor.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(gateway.status.read().await.last_heartbeat.is_some());

        // Drop the link behind the supervisor's back; block reconnects so
        // only the heartbeat outcome is observed.
        mock.set_connect_failures(u32::MAX);
        mock.sever_link();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!gateway.status.read().await.connected);

        supervisor.stop().await;
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_bounded() {
        let mock = MockGateway::named("gw-d", MockGatewayConfig::default());
        let (supervisor, bus) = harness(vec![supervised(mock)], 50);
        supervisor.start();
        supervisor.start(); // idempotent

        let started = std::time::Instant::now();
        supervisor.stop().await;
        supervisor.stop().await; // idempotent
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!supervisor.is_running());
        bus.stop().await;
    }
}
