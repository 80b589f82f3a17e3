use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Type tag for the backend family an adapter speaks. The factory is keyed
/// by this tag; the wire protocols themselves live behind the adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// FIX session backends
    Fix,
    /// REST polling backends
    Rest,
    /// Streaming websocket backends
    Ws,
    /// In-process mock backend used by tests and the demo binary
    Mock,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Fix => "fix",
            BackendKind::Rest => "rest",
            BackendKind::Ws => "ws",
            BackendKind::Mock => "mock",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BackendKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fix" => Ok(BackendKind::Fix),
            "rest" => Ok(BackendKind::Rest),
            "ws" | "websocket" => Ok(BackendKind::Ws),
            "mock" => Ok(BackendKind::Mock),
            other => Err(GatewayError::ConfigurationError(format!(
                "unknown backend kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

/// What a caller asks a gateway to execute. Domain bookkeeping (fills,
/// positions, settlement) lives with the order-management collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub client_order_id: Option<String>,
}

impl OrderSpec {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
            client_order_id: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Limit,
            price: Some(price),
            client_order_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub currency: String,
    pub balance: f64,
    pub available: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
}

/// Immutable per-gateway configuration, created at `initialize()` and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayDescriptor {
    pub name: String,
    pub backend: BackendKind,
    pub weight: u32,
    pub priority: u32,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connection_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub is_primary: bool,
}

impl GatewayDescriptor {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend,
            weight: 1,
            priority: 1,
            min_connections: 1,
            max_connections: 1,
            connection_timeout_ms: 10_000,
            auto_reconnect: true,
            is_primary: false,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_connection_timeout_ms(mut self, ms: u64) -> Self {
        self.connection_timeout_ms = ms;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::ConfigurationError(
                "gateway name cannot be empty".to_string(),
            ));
        }
        if self.min_connections == 0 {
            return Err(GatewayError::ConfigurationError(format!(
                "gateway '{}': min_connections must be at least 1",
                self.name
            )));
        }
        if self.max_connections < self.min_connections {
            return Err(GatewayError::ConfigurationError(format!(
                "gateway '{}': max_connections {} below min_connections {}",
                self.name, self.max_connections, self.min_connections
            )));
        }
        if self.connection_timeout_ms == 0 {
            return Err(GatewayError::ConfigurationError(format!(
                "gateway '{}': connection_timeout_ms cannot be 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Mutable health and accounting state, one per gateway, owned by the
/// orchestrator. `connected == false` excludes the gateway from routing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub connected: bool,
    pub authenticated: bool,
    pub last_connect_time: Option<u64>,
    pub last_disconnect_time: Option<u64>,
    pub last_heartbeat: Option<u64>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub avg_latency_ms: f64,
    pub orders_count: u64,
    pub successful_orders: u64,
    pub failed_orders: u64,
}

impl GatewayStatus {
    /// Terminal once the supervisor has exhausted its reconnect budget.
    pub fn is_terminal(&self, max_reconnect_attempts: u32) -> bool {
        !self.connected && self.error_count >= max_reconnect_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_backend_kind_round_trip() {
        assert_eq!("fix".parse::<BackendKind>().unwrap(), BackendKind::Fix);
        assert_eq!("WebSocket".parse::<BackendKind>().unwrap(), BackendKind::Ws);
        assert!("carrier-pigeon".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Mock.to_string(), "mock");
    }

    #[test]
    fn test_descriptor_validation() {
        let ok = GatewayDescriptor::new("ib-main", BackendKind::Fix);
        assert!(ok.validate().is_ok());

        let empty = GatewayDescriptor::new("  ", BackendKind::Fix);
        assert!(empty.validate().is_err());

        let mut bad_pool = GatewayDescriptor::new("x", BackendKind::Rest);
        bad_pool.min_connections = 4;
        bad_pool.max_connections = 2;
        assert!(bad_pool.validate().is_err());

        let zero_timeout = GatewayDescriptor::new("y", BackendKind::Ws).with_connection_timeout_ms(0);
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_status_terminal() {
        let mut st = GatewayStatus::default();
        st.error_count = 3;
        assert!(st.is_terminal(3));
        st.connected = true;
        assert!(!st.is_terminal(3));
    }

    #[test]
    fn test_order_spec_builders() {
        let m = OrderSpec::market("EUR/USD", OrderSide::Buy, 100.0);
        assert_eq!(m.order_type, OrderType::Market);
        assert!(m.price.is_none());

        let l = OrderSpec::limit("AAPL", OrderSide::Sell, 10.0, 187.5);
        assert_eq!(l.order_type, OrderType::Limit);
        assert_eq!(l.price, Some(187.5));
    }
}
