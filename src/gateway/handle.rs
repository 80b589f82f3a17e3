use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::events::Event;
use crate::gateway::types::{AccountSnapshot, BackendKind, OrderSpec, PositionSnapshot};

/// Callback the orchestrator installs on every handle so adapter-originated
/// events (connect/disconnect/order/trade/position/account/error) reach the
/// event bus without the adapter knowing about the bus.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Capability interface every concrete backend adapter implements.
///
/// Contracts:
/// - `connect()`/`disconnect()` are idempotent no-op successes when the
///   handle is already in the target state.
/// - All operations are safe to invoke concurrently for different
///   orders/queries on the same handle.
/// - Adapters own their wire protocols; callers only see this surface.
#[async_trait]
pub trait GatewayHandle: Send + Sync {
    fn name(&self) -> &str;

    fn backend(&self) -> BackendKind;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Optional post-connect handshake. Backends without a separate
    /// authentication step keep the default no-op.
    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool;

    /// Submit an order, returning the backend-assigned order id.
    async fn submit_order(&self, spec: &OrderSpec) -> Result<String>;

    /// Cancel by order id. `Ok(false)` means the backend did not know the id.
    async fn cancel_order(&self, order_id: &str) -> Result<bool>;

    async fn query_account(&self) -> Result<AccountSnapshot>;

    async fn query_positions(&self) -> Result<Vec<PositionSnapshot>>;

    async fn subscribe_market_data(&self, symbols: &[String]) -> Result<bool>;

    /// Install the event callback. Installing a new sink replaces the old
    /// one; adapters must tolerate the sink being absent.
    fn set_event_sink(&self, sink: EventSink);
}
