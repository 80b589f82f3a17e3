//! In-process mock backend adapter.
//!
//! Implements the full `GatewayHandle` surface with configurable latency,
//! success rates and scripted connect failures so orchestrator, supervisor
//! and alerting behavior can be exercised without a real broker session.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::events::{Event, EventKind};
use crate::gateway::{
    AccountSnapshot, BackendKind, EventSink, GatewayDescriptor, GatewayHandle, OrderSpec,
    PositionSnapshot,
};

#[derive(Debug, Clone)]
pub struct MockGatewayConfig {
    /// Fail this many connect attempts before succeeding. `u32::MAX` means
    /// the gateway never comes up.
    pub connect_failures_before_success: u32,
    pub connect_latency_ms: u64,
    pub order_latency_ms: u64,
    /// Probability that a submitted order is accepted (0.0 to 1.0).
    pub order_success_rate: f64,
    pub fail_subscriptions: bool,
    pub fail_queries: bool,
}

impl Default for MockGatewayConfig {
    fn default() -> Self {
        Self {
            connect_failures_before_success: 0,
            connect_latency_ms: 0,
            order_latency_ms: 0,
            order_success_rate: 1.0,
            fail_subscriptions: false,
            fail_queries: false,
        }
    }
}

/// Behavior presets for common test scenarios.
#[derive(Debug, Clone, Copy)]
pub enum GatewayScenario {
    /// Connects first try, every order accepted
    Stable,
    /// First two connects fail, orders occasionally rejected
    Flaky,
    /// Healthy but slow
    Slow,
    /// Never connects
    Dead,
}

impl GatewayScenario {
    pub fn to_config(self) -> MockGatewayConfig {
        match self {
            GatewayScenario::Stable => MockGatewayConfig::default(),
            GatewayScenario::Flaky => MockGatewayConfig {
                connect_failures_before_success: 2,
                order_success_rate: 0.8,
                ..Default::default()
            },
            GatewayScenario::Slow => MockGatewayConfig {
                connect_latency_ms: 150,
                order_latency_ms: 250,
                ..Default::default()
            },
            GatewayScenario::Dead => MockGatewayConfig {
                connect_failures_before_success: u32::MAX,
                ..Default::default()
            },
        }
    }
}

pub struct MockGateway {
    name: String,
    backend: BackendKind,
    config: Mutex<MockGatewayConfig>,
    connected: AtomicBool,
    authenticated: AtomicBool,
    connect_attempts: AtomicU32,
    remaining_connect_failures: AtomicU32,
    order_seq: AtomicU64,
    open_orders: DashMap<String, OrderSpec>,
    sink: RwLock<Option<EventSink>>,
}

impl MockGateway {
    pub fn named(name: impl Into<String>, config: MockGatewayConfig) -> Arc<Self> {
        let remaining = config.connect_failures_before_success;
        Arc::new(Self {
            name: name.into(),
            backend: BackendKind::Mock,
            config: Mutex::new(config),
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            remaining_connect_failures: AtomicU32::new(remaining),
            order_seq: AtomicU64::new(0),
            open_orders: DashMap::new(),
            sink: RwLock::new(None),
        })
    }

    pub fn scenario(name: impl Into<String>, scenario: GatewayScenario) -> Arc<Self> {
        Self::named(name, scenario.to_config())
    }

    pub fn from_descriptor(descriptor: &GatewayDescriptor) -> Arc<Self> {
        Self::named(descriptor.name.clone(), MockGatewayConfig::default())
    }

    /// Total real connect attempts (idempotent no-op calls not counted).
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_order_count(&self) -> usize {
        self.open_orders.len()
    }

    /// Re-script connect failures at runtime.
    pub fn set_connect_failures(&self, n: u32) {
        self.remaining_connect_failures.store(n, Ordering::SeqCst);
    }

    /// Re-script order acceptance at runtime.
    pub fn set_order_success_rate(&self, rate: f64) {
        self.config.lock().expect("mock config lock poisoned").order_success_rate = rate;
    }

    /// Simulate a silently dropped session: the adapter knows the link is
    /// gone but emits no disconnect event. The heartbeat probe finds out.
    pub fn sever_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        let sink = self.sink.read().expect("mock sink lock poisoned").clone();
        if let Some(sink) = sink {
            sink(Event::new(kind, self.name.clone(), payload));
        }
    }

    async fn simulate_latency(&self, ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl GatewayHandle for MockGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> BackendKind {
        self.backend
    }

    async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(()); // already connected: no-op success
        }
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let latency = self.config.lock().expect("mock config lock poisoned").connect_latency_ms;
        self.simulate_latency(latency).await;

        let remaining = self.remaining_connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.remaining_connect_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(GatewayError::ConnectionError(format!(
                "mock gateway '{}' refused connection",
                self.name
            )));
        }

        self.connected.store(true, Ordering::SeqCst);
        self.emit(EventKind::Connect, json!({ "backend": self.backend.to_string() }));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(()); // already disconnected: no-op success
        }
        self.authenticated.store(false, Ordering::SeqCst);
        self.emit(EventKind::Disconnect, json!({}));
        Ok(())
    }

    async fn authenticate(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::AuthenticationError(format!(
                "mock gateway '{}' is not connected",
                self.name
            )));
        }
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn submit_order(&self, spec: &OrderSpec) -> Result<String> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectionError(format!(
                "mock gateway '{}' is not connected",
                self.name
            )));
        }

        let (latency, success_rate) = {
            let config = self.config.lock().expect("mock config lock poisoned");
            (config.order_latency_ms, config.order_success_rate)
        };
        self.simulate_latency(latency).await;

        let accepted = success_rate >= 1.0
            || (success_rate > 0.0 && rand::thread_rng().gen_bool(success_rate));
        if !accepted {
            return Err(GatewayError::ExecutionError(format!(
                "mock gateway '{}' rejected order for {}",
                self.name, spec.symbol
            )));
        }

        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let order_id = format!("{}-{:06}", self.name, seq);
        self.open_orders.insert(order_id.clone(), spec.clone());
        self.emit(
            EventKind::Order,
            json!({ "order_id": order_id, "symbol": spec.symbol }),
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectionError(format!(
                "mock gateway '{}' is not connected",
                self.name
            )));
        }
        Ok(self.open_orders.remove(order_id).is_some())
    }

    async fn query_account(&self) -> Result<AccountSnapshot> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectionError(format!(
                "mock gateway '{}' is not connected",
                self.name
            )));
        }
        if self.config.lock().expect("mock config lock poisoned").fail_queries {
            return Err(GatewayError::ExecutionError(format!(
                "mock gateway '{}' account query failed",
                self.name
            )));
        }
        Ok(AccountSnapshot {
            account_id: format!("{}-acct", self.name),
            currency: "USD".to_string(),
            balance: 1_000_000.0,
            available: 750_000.0,
        })
    }

    async fn query_positions(&self) -> Result<Vec<PositionSnapshot>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectionError(format!(
                "mock gateway '{}' is not connected",
                self.name
            )));
        }
        if self.config.lock().expect("mock config lock poisoned").fail_queries {
            return Err(GatewayError::ExecutionError(format!(
                "mock gateway '{}' position query failed",
                self.name
            )));
        }
        Ok(vec![PositionSnapshot {
            symbol: "EUR/USD".to_string(),
            quantity: 100_000.0,
            avg_price: 1.0842,
        }])
    }

    async fn subscribe_market_data(&self, symbols: &[String]) -> Result<bool> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectionError(format!(
                "mock gateway '{}' is not connected",
                self.name
            )));
        }
        if self.config.lock().expect("mock config lock poisoned").fail_subscriptions {
            return Err(GatewayError::SubscriptionError(format!(
                "mock gateway '{}' rejected subscription",
                self.name
            )));
        }
        self.emit(EventKind::Trade, json!({ "subscribed": symbols }));
        Ok(true)
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.sink.write().expect("mock sink lock poisoned") = Some(sink);
    }
}
