//! Scheme-keyed registry of transport factories

use super::failover::FailoverTransportFactory;
use super::Transport;
use crate::error::{TransportError, TransportResult};
use crate::testing::{MockNetwork, MockTransportFactory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Creates transports for one URI scheme
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// URI scheme this factory handles, e.g. `mock`
    fn scheme(&self) -> &str;

    /// Create an unstarted transport for `uri`
    async fn create(&self, uri: &str) -> TransportResult<Arc<dyn Transport>>;
}

/// Registry mapping URI schemes to transport factories
#[derive(Default)]
pub struct TransportRegistry {
    factories: RwLock<HashMap<String, Arc<dyn TransportFactory>>>,
}

impl TransportRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry with the `mock` and `failover` schemes wired to `network`
    pub fn with_mock_network(network: Arc<MockNetwork>) -> Arc<Self> {
        Arc::new_cyclic(|registry| {
            let this = Self::default();
            this.register(Arc::new(MockTransportFactory::new(network)));
            this.register(Arc::new(FailoverTransportFactory::new(registry.clone())));
            this
        })
    }

    /// Register a factory, replacing any previous one for the same scheme
    pub fn register(&self, factory: Arc<dyn TransportFactory>) {
        let scheme = factory.scheme().to_ascii_lowercase();
        debug!("Registering transport factory for scheme {}", scheme);
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scheme, factory);
    }

    pub fn factory(&self, scheme: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&scheme.to_ascii_lowercase())
            .cloned()
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        schemes.sort();
        schemes
    }

    /// Create a transport for `uri` with the factory registered for its scheme
    pub async fn create(&self, uri: &str) -> TransportResult<Arc<dyn Transport>> {
        let scheme = uri
            .split_once(':')
            .map(|(scheme, _)| scheme.trim())
            .filter(|scheme| !scheme.is_empty())
            .ok_or_else(|| TransportError::invalid_uri(uri, "missing scheme"))?;

        let factory = self
            .factory(scheme)
            .ok_or_else(|| TransportError::UnknownScheme {
                scheme: scheme.to_string(),
            })?;

        factory.create(uri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::transport::failover::FailoverTransport;
    use crate::transport::narrow;

    #[tokio::test]
    async fn test_create_by_scheme() {
        // Arrange
        let registry = TransportRegistry::with_mock_network(MockNetwork::new());

        // Act
        let mock = registry.create("mock://localhost:61616").await.unwrap();
        let failover = registry
            .create("failover://(mock://localhost:61616)")
            .await
            .unwrap();

        // Assert
        assert!(narrow::<MockTransport>(&mock).is_some());
        assert!(narrow::<FailoverTransport>(&failover).is_some());
        assert!(failover.is_fault_tolerant());
        assert_eq!(registry.schemes(), vec!["failover", "mock"]);
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let registry = TransportRegistry::new();

        let result = registry.create("tcp://localhost:61616").await;

        assert!(matches!(
            result.err(),
            Some(TransportError::UnknownScheme { scheme }) if scheme == "tcp"
        ));
    }

    #[tokio::test]
    async fn test_missing_scheme() {
        let registry = TransportRegistry::new();
        assert!(matches!(
            registry.create("localhost").await.err(),
            Some(TransportError::InvalidUri { .. })
        ));
    }
}
