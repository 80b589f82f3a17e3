//! Orchestrator construction and connection lifecycle.
//!
//! Holds the per-gateway entries (descriptor + handle + status), wires
//! adapter events onto the bus, fans connect/disconnect out over a bounded
//! worker pool and owns the supervisor lifecycle. Routed operations live in
//! `operations.rs`.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::timeout;

use crate::alerts::{AlertEngine, AlertRule};
use crate::config::Settings;
use crate::error::{GatewayError, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::gateway::{GatewayDescriptor, GatewayFactory, GatewayHandle, GatewayStatus};
use crate::metrics::{MetricObserver, MetricsCollector};
use crate::orchestrator::OrderTable;
use crate::routing::{PrimaryElector, RouteStrategy};
use crate::supervisor::{ConnectionHealthSupervisor, SupervisedGateway, SupervisorConfig};
use crate::utils::now_millis;

/// One registered gateway: immutable descriptor, live handle, shared status.
#[derive(Clone)]
pub struct GatewayEntry {
    pub descriptor: GatewayDescriptor,
    pub handle: Arc<dyn GatewayHandle>,
    pub status: Arc<RwLock<GatewayStatus>>,
}

pub struct GatewayOrchestrator {
    pub(crate) settings: Settings,
    pub(crate) registration_order: StdRwLock<Vec<String>>,
    pub(crate) entries: DashMap<String, GatewayEntry>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) collector: Arc<MetricsCollector>,
    pub(crate) alerts: Arc<AlertEngine>,
    pub(crate) strategy: Arc<dyn RouteStrategy>,
    pub(crate) elector: PrimaryElector,
    factory: GatewayFactory,
    pub(crate) order_table: Option<Arc<dyn OrderTable>>,
    supervisor: Mutex<Option<Arc<ConnectionHealthSupervisor>>>,
    pub(crate) fanout: Arc<Semaphore>,
    initialized: AtomicBool,
}

impl GatewayOrchestrator {
    pub fn new(
        settings: Settings,
        strategy: Arc<dyn RouteStrategy>,
        factory: GatewayFactory,
        order_table: Option<Arc<dyn OrderTable>>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(settings.bus_stop_timeout()));
        let collector = Arc::new(MetricsCollector::new(
            settings.metrics_window_samples,
            settings.metrics_horizon(),
        ));
        let alerts = Arc::new(AlertEngine::new(settings.alert_history_limit));
        // Every recorded sample is pushed straight into rule evaluation.
        collector.attach_observer(Arc::clone(&alerts) as Arc<dyn MetricObserver>);

        let fanout = Arc::new(Semaphore::new(settings.fanout_concurrency.max(1)));

        Self {
            settings,
            registration_order: StdRwLock::new(Vec::new()),
            entries: DashMap::new(),
            bus,
            collector,
            alerts,
            strategy,
            elector: PrimaryElector::new(),
            factory,
            order_table,
            supervisor: Mutex::new(None),
            fanout,
            initialized: AtomicBool::new(false),
        }
    }

    /// Validate descriptors and rules, build one handle per descriptor via
    /// the factory, wire adapter events onto the bus and register the rules.
    /// Fatal on any configuration problem; can only run once.
    pub fn initialize(
        &self,
        descriptors: Vec<GatewayDescriptor>,
        rules: Vec<AlertRule>,
    ) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(GatewayError::ConfigurationError(
                "orchestrator already initialized".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut primary: Option<String> = None;
        for descriptor in &descriptors {
            descriptor.validate()?;
            if !names.insert(descriptor.name.clone()) {
                return Err(GatewayError::ConfigurationError(format!(
                    "duplicate gateway name '{}'",
                    descriptor.name
                )));
            }
            if descriptor.is_primary {
                if let Some(existing) = &primary {
                    return Err(GatewayError::ConfigurationError(format!(
                        "gateways '{}' and '{}' both flagged primary",
                        existing, descriptor.name
                    )));
                }
                primary = Some(descriptor.name.clone());
            }
        }

        for rule in rules {
            self.alerts.register_rule(rule)?;
        }

        for descriptor in descriptors {
            let handle = self.factory.create(&descriptor)?;
            let bus = Arc::clone(&self.bus);
            handle.set_event_sink(Arc::new(move |event: Event| {
                if let Err(e) = bus.publish(event) {
                    debug!("Adapter event dropped: {}", e);
                }
            }));

            let name = descriptor.name.clone();
            self.entries.insert(
                name.clone(),
                GatewayEntry {
                    descriptor,
                    handle,
                    status: Arc::new(RwLock::new(GatewayStatus::default())),
                },
            );
            self.registration_order
                .write()
                .expect("registration order lock poisoned")
                .push(name);
        }

        self.elector.set_configured(primary);
        self.bus.start();
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            "🚀 Orchestrator initialized with {} gateway(s), strategy '{}'",
            self.entries.len(),
            self.strategy.name()
        );
        Ok(())
    }

    pub(crate) fn registration_order(&self) -> Vec<String> {
        self.registration_order
            .read()
            .expect("registration order lock poisoned")
            .clone()
    }

    pub(crate) fn entry(&self, name: &str) -> Option<GatewayEntry> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    /// Connect every gateway concurrently (bounded fan-out) and return a
    /// per-gateway success map. A failing gateway stays out of the active
    /// set without aborting its siblings. Starts the supervisor for
    /// auto-reconnect gateways once the fan-in completes.
    pub async fn connect_all(&self) -> HashMap<String, bool> {
        info!("📡 Connecting {} gateway(s)...", self.entries.len());
        let mut tasks = Vec::new();
        for name in self.registration_order() {
            let entry = match self.entry(&name) {
                Some(e) => e,
                None => continue,
            };
            let collector = Arc::clone(&self.collector);
            let bus = Arc::clone(&self.bus);
            let semaphore = Arc::clone(&self.fanout);
            tasks.push(tokio::spawn(async move {
                // The semaphore is never closed; a failed acquire only means
                // the pool is shutting down, in which case run unbounded.
                let _permit = semaphore.acquire_owned().await.ok();
                let ok = Self::connect_one(&entry, &collector, &bus).await;
                (entry.descriptor.name.clone(), ok)
            }));
        }

        let mut results = HashMap::new();
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok((name, ok)) => {
                    results.insert(name, ok);
                }
                Err(e) => error!("connect_all worker failed to join: {}", e),
            }
        }

        let up = results.values().filter(|ok| **ok).count();
        info!("📡 connect_all finished: {}/{} gateway(s) up", up, results.len());

        self.start_supervisor().await;
        results
    }

    async fn connect_one(
        entry: &GatewayEntry,
        collector: &Arc<MetricsCollector>,
        bus: &Arc<EventBus>,
    ) -> bool {
        let name = entry.descriptor.name.clone();
        if entry.status.read().await.connected {
            return true; // already connected: no-op success
        }

        let connect_timeout = entry.descriptor.connection_timeout();
        let connected: Result<()> = match timeout(connect_timeout, entry.handle.connect()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::OperationTimeout(format!(
                "connect on '{}' exceeded {:?}",
                name, connect_timeout
            ))),
        };

        let outcome: Result<()> = match connected {
            Ok(()) => match timeout(connect_timeout, entry.handle.authenticate()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::OperationTimeout(format!(
                    "authenticate on '{}' exceeded {:?}",
                    name, connect_timeout
                ))),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                {
                    let mut status = entry.status.write().await;
                    status.connected = true;
                    status.authenticated = true;
                    status.error_count = 0;
                    status.last_error = None;
                    status.last_connect_time = Some(now_millis());
                }
                collector.record_connection_status(&name, true);
                let _ = bus.publish(Event::new(
                    EventKind::Connect,
                    name.clone(),
                    json!({ "source": "connect_all" }),
                ));
                info!("✅ Gateway '{}' connected", name);
                true
            }
            Err(e) => {
                // A half-open session (connected but failed auth) is torn
                // down; disconnect is an idempotent no-op otherwise.
                let _ = entry.handle.disconnect().await;
                {
                    let mut status = entry.status.write().await;
                    status.connected = false;
                    status.authenticated = false;
                    status.error_count = status.error_count.saturating_add(1);
                    status.last_error = Some(e.to_string());
                }
                collector.record_connection_status(&name, false);
                collector.record_error(&name, e.metric_kind(), e.to_string());
                let _ = bus.publish(Event::new(
                    EventKind::Error,
                    name.clone(),
                    json!({ "operation": "connect", "error": e.to_string() }),
                ));
                error!("❌ Gateway '{}' failed to connect: {}", name, e);
                false
            }
        }
    }

    /// Stop the supervisor first (no reconnect racing the shutdown), then
    /// disconnect active gateways concurrently. A gateway that fails to
    /// disconnect stays marked connected.
    pub async fn disconnect_all(&self) -> HashMap<String, bool> {
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.stop().await;
        }

        let mut tasks = Vec::new();
        for name in self.registration_order() {
            let entry = match self.entry(&name) {
                Some(e) => e,
                None => continue,
            };
            if !entry.status.read().await.connected {
                continue;
            }
            let collector = Arc::clone(&self.collector);
            let bus = Arc::clone(&self.bus);
            let semaphore = Arc::clone(&self.fanout);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let ok = Self::disconnect_one(&entry, &collector, &bus).await;
                (entry.descriptor.name.clone(), ok)
            }));
        }

        let mut results = HashMap::new();
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok((name, ok)) => {
                    results.insert(name, ok);
                }
                Err(e) => error!("disconnect_all worker failed to join: {}", e),
            }
        }
        info!("🛑 disconnect_all finished for {} gateway(s)", results.len());
        results
    }

    async fn disconnect_one(
        entry: &GatewayEntry,
        collector: &Arc<MetricsCollector>,
        bus: &Arc<EventBus>,
    ) -> bool {
        let name = entry.descriptor.name.clone();
        let disconnect_timeout = entry.descriptor.connection_timeout();

        let outcome: Result<()> = match timeout(disconnect_timeout, entry.handle.disconnect()).await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::OperationTimeout(format!(
                "disconnect on '{}' exceeded {:?}",
                name, disconnect_timeout
            ))),
        };

        match outcome {
            Ok(()) => {
                {
                    let mut status = entry.status.write().await;
                    status.connected = false;
                    status.authenticated = false;
                    status.last_disconnect_time = Some(now_millis());
                }
                collector.record_connection_status(&name, false);
                let _ = bus.publish(Event::new(
                    EventKind::Disconnect,
                    name.clone(),
                    json!({ "source": "disconnect_all" }),
                ));
                info!("✅ Gateway '{}' disconnected", name);
                true
            }
            Err(e) => {
                collector.record_error(&name, e.metric_kind(), e.to_string());
                warn!("⚠️ Gateway '{}' failed to disconnect: {}", name, e);
                false
            }
        }
    }

    async fn start_supervisor(&self) {
        let supervised: Vec<SupervisedGateway> = self
            .registration_order()
            .into_iter()
            .filter_map(|name| self.entry(&name))
            .filter(|entry| entry.descriptor.auto_reconnect)
            .map(|entry| SupervisedGateway {
                descriptor: entry.descriptor.clone(),
                handle: Arc::clone(&entry.handle),
                status: Arc::clone(&entry.status),
            })
            .collect();

        if supervised.is_empty() {
            debug!("No auto-reconnect gateways; supervisor not started");
            return;
        }

        let mut guard = self.supervisor.lock().await;
        if guard.is_some() {
            debug!("Supervisor already running");
            return;
        }

        let supervisor = Arc::new(ConnectionHealthSupervisor::new(
            SupervisorConfig {
                reconnect_interval: self.settings.reconnect_interval(),
                heartbeat_interval: self.settings.heartbeat_interval(),
                max_reconnect_attempts: self.settings.max_reconnect_attempts,
            },
            supervised,
            Arc::clone(&self.collector),
            Arc::clone(&self.bus),
        ));
        supervisor.start();
        *guard = Some(supervisor);
    }

    /// Full teardown: disconnect everything, then stop the bus.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        self.bus.stop().await;
        info!("🛑 Orchestrator shut down");
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.collector)
    }

    pub fn alerts(&self) -> Arc<AlertEngine> {
        Arc::clone(&self.alerts)
    }

    pub async fn supervisor_running(&self) -> bool {
        match self.supervisor.lock().await.as_ref() {
            Some(s) => s.is_running(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::BackendKind;
    use crate::routing::{strategy_for, RouteKind};
    use crate::testing::{GatewayScenario, MockGateway};
    use pretty_assertions::assert_eq;

    fn mock_factory_with(scenarios: Vec<(&str, GatewayScenario)>) -> GatewayFactory {
        let factory = GatewayFactory::new();
        let table: HashMap<String, GatewayScenario> = scenarios
            .into_iter()
            .map(|(name, s)| (name.to_string(), s))
            .collect();
        factory.register(
            BackendKind::Mock,
            Arc::new(move |descriptor: &GatewayDescriptor| {
                let scenario = table
                    .get(&descriptor.name)
                    .copied()
                    .unwrap_or(GatewayScenario::Stable);
                MockGateway::scenario(descriptor.name.clone(), scenario)
                    as Arc<dyn GatewayHandle>
            }),
        );
        factory
    }

    fn orchestrator_with(
        factory: GatewayFactory,
        descriptors: Vec<GatewayDescriptor>,
    ) -> GatewayOrchestrator {
        let orchestrator = GatewayOrchestrator::new(
            Settings::default(),
            strategy_for(RouteKind::Failover),
            factory,
            None,
        );
        orchestrator.initialize(descriptors, Vec::new()).unwrap();
        orchestrator
    }

    fn descriptor(name: &str) -> GatewayDescriptor {
        GatewayDescriptor::new(name, BackendKind::Mock)
            .with_auto_reconnect(false)
            .with_connection_timeout_ms(1_000)
    }

    #[tokio::test]
    async fn test_initialize_rejects_duplicate_names() {
        let orchestrator = GatewayOrchestrator::new(
            Settings::default(),
            strategy_for(RouteKind::Failover),
            GatewayFactory::with_defaults(),
            None,
        );
        let err = orchestrator
            .initialize(vec![descriptor("same"), descriptor("same")], Vec::new())
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_initialize_rejects_two_primaries() {
        let orchestrator = GatewayOrchestrator::new(
            Settings::default(),
            strategy_for(RouteKind::Failover),
            GatewayFactory::with_defaults(),
            None,
        );
        let err = orchestrator
            .initialize(
                vec![descriptor("a").primary(), descriptor("b").primary()],
                Vec::new(),
            )
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let orchestrator = orchestrator_with(GatewayFactory::with_defaults(), vec![descriptor("a")]);
        let err = orchestrator
            .initialize(vec![descriptor("b")], Vec::new())
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigurationError(_)));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_all_partial_failure_defines_active_set() {
        let factory = mock_factory_with(vec![
            ("up", GatewayScenario::Stable),
            ("down", GatewayScenario::Dead),
        ]);
        let orchestrator =
            orchestrator_with(factory, vec![descriptor("up"), descriptor("down")]);

        let results = orchestrator.connect_all().await;
        assert_eq!(results.get("up"), Some(&true));
        assert_eq!(results.get("down"), Some(&false));

        assert_eq!(orchestrator.active_gateways().await, vec!["up".to_string()]);
        let down_status = orchestrator.gateway_status("down").await.unwrap();
        assert_eq!(down_status.error_count, 1);
        assert!(down_status.last_error.is_some());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_all_is_idempotent_for_connected_gateways() {
        let orchestrator = orchestrator_with(GatewayFactory::with_defaults(), vec![descriptor("a")]);
        let first = orchestrator.connect_all().await;
        let second = orchestrator.connect_all().await;
        assert_eq!(first.get("a"), Some(&true));
        assert_eq!(second.get("a"), Some(&true));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_all_clears_active_set() {
        let orchestrator = orchestrator_with(
            GatewayFactory::with_defaults(),
            vec![descriptor("a"), descriptor("b")],
        );
        orchestrator.connect_all().await;
        assert_eq!(orchestrator.active_gateways().await.len(), 2);

        let results = orchestrator.disconnect_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|ok| *ok));
        assert!(orchestrator.active_gateways().await.is_empty());

        // Second call has nothing left to do.
        let again = orchestrator.disconnect_all().await;
        assert!(again.is_empty());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_supervisor_started_only_for_auto_reconnect() {
        let orchestrator = orchestrator_with(GatewayFactory::with_defaults(), vec![descriptor("a")]);
        orchestrator.connect_all().await;
        assert!(!orchestrator.supervisor_running().await);
        orchestrator.shutdown().await;

        let orchestrator = orchestrator_with(
            GatewayFactory::with_defaults(),
            vec![descriptor("b").with_auto_reconnect(true)],
        );
        orchestrator.connect_all().await;
        assert!(orchestrator.supervisor_running().await);
        orchestrator.shutdown().await;
        assert!(!orchestrator.supervisor_running().await);
    }
}
