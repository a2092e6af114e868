use super::FailoverTransport;
use crate::error::{TransportError, TransportResult};
use crate::transport::{Transport, TransportFactory, TransportRegistry};
use async_trait::async_trait;
use std::sync::{Arc, Weak};

/// Creates [`FailoverTransport`]s for `failover:` URIs
///
/// Holds the registry weakly; the registry owns its factories and component
/// transports are created through it.
pub struct FailoverTransportFactory {
    registry: Weak<TransportRegistry>,
}

impl FailoverTransportFactory {
    pub fn new(registry: Weak<TransportRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TransportFactory for FailoverTransportFactory {
    fn scheme(&self) -> &str {
        "failover"
    }

    async fn create(&self, uri: &str) -> TransportResult<Arc<dyn Transport>> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| TransportError::io("transport registry was dropped"))?;
        let transport: Arc<dyn Transport> = FailoverTransport::from_uri(uri, registry)?;
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNetwork;

    #[tokio::test]
    async fn test_options_reach_failover_config() {
        let registry = TransportRegistry::with_mock_network(MockNetwork::new());
        let factory = FailoverTransportFactory::new(Arc::downgrade(&registry));

        let transport = factory
            .create("failover:(mock://a:1,mock://b:2)?randomize=false&maxReconnectAttempts=2")
            .await
            .unwrap();

        let failover = transport.into_any().downcast::<FailoverTransport>().unwrap();
        assert!(!failover.config().randomize);
        assert_eq!(failover.config().max_reconnect_attempts, Some(2));
        assert_eq!(failover.uri_pool().members(), vec!["mock://a:1", "mock://b:2"]);
    }

    #[tokio::test]
    async fn test_dropped_registry_is_an_error() {
        let registry = TransportRegistry::new();
        let factory = FailoverTransportFactory::new(Arc::downgrade(&registry));
        drop(registry);

        let result = factory.create("failover:(mock://a:1)").await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bad_option_value_is_rejected() {
        let registry = TransportRegistry::with_mock_network(MockNetwork::new());
        let factory = FailoverTransportFactory::new(Arc::downgrade(&registry));

        let result = factory.create("failover:(mock://a:1)?backOffMultiplier=abc").await;

        assert!(matches!(result, Err(TransportError::Config(_))));
    }
}
