//! Mock gateway environment for tests and the demo binary.

pub mod mock_gateway;

pub use mock_gateway::{GatewayScenario, MockGateway, MockGatewayConfig};
