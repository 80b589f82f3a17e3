pub mod alerts;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod metrics;
pub mod orchestrator;
pub mod routing;
pub mod supervisor;
pub mod testing; // Mock gateway environment for tests and demos
pub mod utils;

// Re-export the key public surface
pub use alerts::{default_rules, Alert, AlertEngine, AlertLevel, AlertRule, Condition, RuleMetric};
pub use config::Settings;
pub use error::{GatewayError, Result};
pub use events::{Event, EventBus, EventKind};
pub use gateway::{
    AccountSnapshot, BackendKind, GatewayDescriptor, GatewayFactory, GatewayHandle, GatewayStatus,
    OrderSide, OrderSpec, OrderType, PositionSnapshot,
};
pub use metrics::{GatewayStats, MetricsCollector};
pub use orchestrator::{GatewayOrchestrator, OrderTable};
pub use routing::{strategy_for, GatewayView, RouteKind, RouteStrategy};
pub use supervisor::{ConnectionHealthSupervisor, SupervisorConfig};
