//! Top-level façade composing the bus, handles, routing, supervisor,
//! metrics and alerting. The only entry point callers use.

pub mod core;
pub mod operations;

pub use self::core::{GatewayEntry, GatewayOrchestrator};

/// External order-management collaborator: resolves which gateway owns an
/// order id when a cancel arrives without an explicit gateway name. The
/// bookkeeping itself is out of scope here.
pub trait OrderTable: Send + Sync {
    fn owner_of(&self, order_id: &str) -> Option<String>;
}
