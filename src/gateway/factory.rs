use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::gateway::handle::GatewayHandle;
use crate::gateway::types::{BackendKind, GatewayDescriptor};

/// Constructor closure registered per backend kind.
pub type HandleCtor = Arc<dyn Fn(&GatewayDescriptor) -> Arc<dyn GatewayHandle> + Send + Sync>;

/// Polymorphic handle construction keyed by backend type tag. Concrete
/// adapters register themselves here; `initialize()` resolves each
/// descriptor through this registry.
pub struct GatewayFactory {
    ctors: DashMap<BackendKind, HandleCtor>,
}

impl GatewayFactory {
    /// Empty registry - callers register every adapter they support.
    pub fn new() -> Self {
        Self {
            ctors: DashMap::new(),
        }
    }

    /// Registry pre-loaded with the in-process mock adapter, enough for
    /// tests and the demo binary.
    pub fn with_defaults() -> Self {
        let factory = Self::new();
        factory.register(
            BackendKind::Mock,
            Arc::new(|descriptor: &GatewayDescriptor| {
                crate::testing::MockGateway::from_descriptor(descriptor)
                    as Arc<dyn GatewayHandle>
            }),
        );
        factory
    }

    /// Register (or replace) the constructor for a backend kind.
    pub fn register(&self, kind: BackendKind, ctor: HandleCtor) {
        self.ctors.insert(kind, ctor);
    }

    pub fn supports(&self, kind: BackendKind) -> bool {
        self.ctors.contains_key(&kind)
    }

    pub fn create(&self, descriptor: &GatewayDescriptor) -> Result<Arc<dyn GatewayHandle>> {
        match self.ctors.get(&descriptor.backend) {
            Some(ctor) => Ok(ctor(descriptor)),
            None => Err(GatewayError::ConfigurationError(format!(
                "no adapter registered for backend kind '{}' (gateway '{}')",
                descriptor.backend, descriptor.name
            ))),
        }
    }
}

impl Default for GatewayFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_is_configuration_error() {
        let factory = GatewayFactory::new();
        let descriptor = GatewayDescriptor::new("ib", BackendKind::Fix);
        let err = factory.create(&descriptor).err().unwrap();
        assert!(matches!(err, GatewayError::ConfigurationError(_)));
    }

    #[test]
    fn test_default_registry_builds_mock() {
        let factory = GatewayFactory::with_defaults();
        assert!(factory.supports(BackendKind::Mock));
        let descriptor = GatewayDescriptor::new("sim", BackendKind::Mock);
        let handle = factory.create(&descriptor).unwrap();
        assert_eq!(handle.name(), "sim");
        assert_eq!(handle.backend(), BackendKind::Mock);
    }
}
