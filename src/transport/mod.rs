//! Transport layer abstractions
//!
//! A [`Transport`] moves [`Command`]s to and from one broker. Physical
//! transports are created from URIs through a [`TransportRegistry`]; the
//! failover transport implements the same trait on top of them, so client
//! code never needs to know which one it holds. Use [`narrow`] to reach the
//! concrete type behind a generic handle.

pub mod failover;
pub mod registry;
pub mod uri;

pub use registry::{TransportFactory, TransportRegistry};
pub use uri::{CompositeUri, TransportUri};

use crate::error::{TransportError, TransportResult};
use crate::protocol::{Command, Response};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Transport trait for broker communication
///
/// Implementations are shared behind `Arc<dyn Transport>`; every method
/// takes `&self` and is safe to call from any task.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Begin delivering inbound commands to the listener
    async fn start(&self) -> TransportResult<()>;

    /// Stop delivering inbound commands; the transport may be started again
    async fn stop(&self) -> TransportResult<()>;

    /// Release every resource; a closed transport cannot be restarted
    async fn close(&self) -> TransportResult<()>;

    /// Send a command without waiting for a response
    async fn oneway(&self, command: Command) -> TransportResult<()>;

    /// Send a command and wait for its correlated response
    async fn request(
        &self,
        _command: Command,
        _timeout: Option<Duration>,
    ) -> TransportResult<Response> {
        Err(TransportError::unsupported("request"))
    }

    /// Send a command and return a handle to its future response
    async fn async_request(
        &self,
        _command: Command,
        _callback: Option<Arc<dyn ResponseCallback>>,
    ) -> TransportResult<FutureResponse> {
        Err(TransportError::unsupported("async_request"))
    }

    /// Ask the transport to connect to a different broker
    async fn reconnect(&self, _uri: &str) -> TransportResult<()> {
        Err(TransportError::unsupported("reconnect"))
    }

    /// Replace the broker-provided part of the candidate list
    async fn update_uris(&self, _rebalance: bool, _uris: &[String]) -> TransportResult<()> {
        Err(TransportError::unsupported("update_uris"))
    }

    fn set_transport_listener(&self, listener: Arc<dyn TransportListener>);

    fn is_connected(&self) -> bool;

    fn is_closed(&self) -> bool;

    fn is_fault_tolerant(&self) -> bool {
        false
    }

    fn is_reconnect_supported(&self) -> bool {
        false
    }

    fn is_update_uris_supported(&self) -> bool {
        false
    }

    /// Address of the broker currently connected to, if any
    fn remote_address(&self) -> Option<String> {
        None
    }

    /// Transport this one delegates to, used by [`narrow`]
    fn inner_transport(&self) -> Option<Arc<dyn Transport>> {
        None
    }

    /// Upcast for [`narrow`]
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Find a transport of concrete type `T` in a chain of transports
///
/// # Examples
/// ```
/// use broker_failover::testing::MockTransport;
/// use broker_failover::transport::{narrow, Transport, TransportUri};
/// use std::sync::Arc;
///
/// let uri = TransportUri::parse("mock://localhost:61616").unwrap();
/// let transport: Arc<dyn Transport> = MockTransport::new(&uri, None);
///
/// assert!(narrow::<MockTransport>(&transport).is_some());
/// ```
pub fn narrow<T: Transport>(transport: &Arc<dyn Transport>) -> Option<Arc<T>> {
    let mut current = Some(transport.clone());
    while let Some(candidate) = current {
        let next = candidate.inner_transport();
        if let Ok(found) = candidate.into_any().downcast::<T>() {
            return Some(found);
        }
        current = next;
    }
    None
}

/// Receiver of transport events
///
/// Callbacks run on the transport's own task and must not block.
pub trait TransportListener: Send + Sync {
    /// An inbound command arrived
    fn on_command(&self, command: Command);

    /// The transport failed; it will not deliver further commands
    fn on_exception(&self, error: TransportError);

    /// A fault tolerant transport lost its connection and is reconnecting
    fn transport_interrupted(&self) {}

    /// A fault tolerant transport reconnected and restored its state
    fn transport_resumed(&self) {}
}

/// Listener that only logs what it receives
#[derive(Debug, Default)]
pub struct DefaultTransportListener;

impl TransportListener for DefaultTransportListener {
    fn on_command(&self, command: Command) {
        debug!("Received {} with no listener installed", command.kind());
    }

    fn on_exception(&self, error: TransportError) {
        warn!("Transport failure with no listener installed: {}", error);
    }

    fn transport_interrupted(&self) {
        info!("Transport interrupted");
    }

    fn transport_resumed(&self) {
        info!("Transport resumed");
    }
}

/// Completion callback for [`Transport::async_request`]
pub trait ResponseCallback: Send + Sync {
    fn on_complete(&self, response: &Response);
}

/// Sending half of a [`FutureResponse`]
pub type ResponseSender = oneshot::Sender<TransportResult<Response>>;

/// Handle to a response that has not arrived yet
#[derive(Debug)]
pub struct FutureResponse {
    rx: oneshot::Receiver<TransportResult<Response>>,
}

impl FutureResponse {
    pub fn channel() -> (ResponseSender, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Wait for the response without a deadline
    pub async fn get(self) -> TransportResult<Response> {
        self.rx.await.unwrap_or(Err(TransportError::Closed))
    }

    /// Wait for the response for at most `timeout`
    pub async fn get_timeout(self, timeout: Duration) -> TransportResult<Response> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(
                "response",
                timeout.as_millis() as u64,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    #[tokio::test]
    async fn test_future_response_resolves() {
        let (tx, future) = FutureResponse::channel();
        tx.send(Ok(Response::ok(5))).unwrap();

        let response = future.get().await.unwrap();
        assert_eq!(response.correlation_id, 5);
    }

    #[tokio::test]
    async fn test_dropped_sender_means_closed() {
        let (tx, future) = FutureResponse::channel();
        drop(tx);

        assert_eq!(future.get().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_future_response_timeout() {
        let (_tx, future) = FutureResponse::channel();

        let result = future.get_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TransportError::Timeout { .. })));
    }

    #[test]
    fn test_narrow_to_wrong_type_fails() {
        let uri = TransportUri::parse("mock://localhost:61616").unwrap();
        let transport: Arc<dyn Transport> = MockTransport::new(&uri, None);

        assert!(narrow::<MockTransport>(&transport).is_some());
        assert!(narrow::<failover::FailoverTransport>(&transport).is_none());
    }
}
