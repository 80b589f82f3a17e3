//! Gateway capability layer: the `GatewayHandle` trait every backend adapter
//! implements, the descriptor/status data model, and the factory that turns
//! backend type tags into concrete handles.

pub mod factory;
pub mod handle;
pub mod types;

pub use factory::{GatewayFactory, HandleCtor};
pub use handle::{EventSink, GatewayHandle};
pub use types::{
    AccountSnapshot, BackendKind, GatewayDescriptor, GatewayStatus, OrderSide, OrderSpec,
    OrderType, PositionSnapshot,
};
