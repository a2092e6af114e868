//! Mock transports for testing
//!
//! Mock transports connect to [`MockBroker`]s on a [`MockNetwork`] instead of
//! a socket. Behaviour is steered by URI options:
//!
//! - `failOnCreate=true`: the factory refuses to create the transport
//! - `failOnStart=true`: `start()` fails
//! - `failAfterStart=true`: `start()` succeeds but the transport fails right
//!   away, reporting it to the listener
//! - `failOnSendMessage=true`: sending a `Message` fails the transport, after
//!   `numSentMessageBeforeFail` successful message sends (default 0)
//! - `rejectCommand=<Kind>`: commands of that kind get an exception response
//! - `ignoreCommand=<Kind>`: commands of that kind are delivered but never answered
//! - `name=<name>`: name used in logs

use super::network::{MockBroker, MockNetwork};
use crate::error::{TransportError, TransportResult};
use crate::protocol::{Command, Response};
use crate::transport::{Transport, TransportFactory, TransportListener, TransportUri};
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::debug;

/// Transport talking to an in-process [`MockBroker`]
pub struct MockTransport {
    this: Weak<MockTransport>,
    uri: TransportUri,
    name: String,
    broker: Option<Arc<MockBroker>>,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    sent: Mutex<Vec<Command>>,
    started: AtomicBool,
    closed: AtomicBool,
    failed: AtomicBool,
    messages_sent: AtomicUsize,
    fail_on_start: bool,
    fail_after_start: bool,
    fail_on_send_message: bool,
    num_sent_before_fail: usize,
    reject_command: Option<String>,
    ignore_command: Option<String>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("uri", &self.uri.as_str())
            .field("name", &self.name)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("failed", &self.failed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockTransport {
    /// Create a transport for `uri`; without a broker every connect succeeds
    pub fn new(uri: &TransportUri, broker: Option<Arc<MockBroker>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            uri: uri.clone(),
            name: uri
                .option("name")
                .map(str::to_string)
                .unwrap_or_else(|| uri.address()),
            broker,
            listener: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            messages_sent: AtomicUsize::new(0),
            fail_on_start: uri.flag("failOnStart"),
            fail_after_start: uri.flag("failAfterStart"),
            fail_on_send_message: uri.flag("failOnSendMessage"),
            num_sent_before_fail: uri
                .option("numSentMessageBeforeFail")
                .and_then(|value| value.parse().ok())
                .unwrap_or(0),
            reject_command: uri.option("rejectCommand").map(str::to_string),
            ignore_command: uri.option("ignoreCommand").map(str::to_string),
        })
    }

    pub fn uri(&self) -> &TransportUri {
        &self.uri
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> Option<&Arc<MockBroker>> {
        self.broker.as_ref()
    }

    /// Every command successfully sent through this transport
    pub fn sent_commands(&self) -> Vec<Command> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Started, not closed and not failed
    pub fn is_healthy(&self) -> bool {
        self.is_started() && !self.closed.load(Ordering::SeqCst) && !self.failed.load(Ordering::SeqCst)
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Deliver an inbound command to the listener, as if sent by the broker
    pub fn fire_command(&self, command: Command) {
        if let Some(listener) = self.listener() {
            listener.on_command(command);
        }
    }

    /// Fail the transport and report it to the listener once
    pub fn fail(&self, reason: &str) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Mock transport {} failed: {}", self.name, reason);
        if let Some(listener) = self.listener() {
            listener.on_exception(TransportError::io(reason));
        }
    }

    fn check_usable(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::io(format!("{} is closed", self.name)));
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(TransportError::io(format!("{} has failed", self.name)));
        }
        if !self.is_started() {
            return Err(TransportError::io(format!("{} is not started", self.name)));
        }
        Ok(())
    }

    fn should_fail_send(&self, command: &Command) -> bool {
        if !self.fail_on_send_message || !command.is_message() {
            return false;
        }
        let previous = self.messages_sent.fetch_add(1, Ordering::SeqCst);
        previous >= self.num_sent_before_fail
    }

    fn respond(&self, command: &Command) {
        if !command.response_required
            || self.ignore_command.as_deref() == Some(command.kind())
        {
            return;
        }
        let response = match &self.reject_command {
            Some(kind) if kind == command.kind() => Response::exception(
                command.command_id,
                format!("{} rejected by {}", kind, self.name),
            ),
            _ => Response::ok(command.command_id),
        };
        self.fire_command(Command::response(response));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::io(format!("{} is closed", self.name)));
        }
        if self.is_started() {
            return Ok(());
        }
        if self.fail_on_start {
            return Err(TransportError::connect_failed(
                self.uri.as_str(),
                "failOnStart",
            ));
        }
        if let (Some(broker), Some(this)) = (&self.broker, self.this.upgrade()) {
            broker.accept(&this)?;
        }
        self.started.store(true, Ordering::SeqCst);
        if self.fail_after_start {
            self.fail("failAfterStart");
        }
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.started.store(false, Ordering::SeqCst);
        if let Some(broker) = &self.broker {
            broker.disconnect(self);
        }
        Ok(())
    }

    async fn oneway(&self, command: Command) -> TransportResult<()> {
        self.check_usable()?;

        if self.should_fail_send(&command) {
            let reason = format!("{} failed sending {}", self.name, command.kind());
            self.fail(&reason);
            return Err(TransportError::io(reason));
        }

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.clone());
        if let Some(broker) = &self.broker {
            broker.deliver(&command);
        }
        self.respond(&command);
        Ok(())
    }

    fn set_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    fn is_connected(&self) -> bool {
        self.is_healthy()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.uri.as_str().to_string())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Factory for the `mock` scheme
#[derive(Debug)]
pub struct MockTransportFactory {
    network: Arc<MockNetwork>,
}

impl MockTransportFactory {
    pub fn new(network: Arc<MockNetwork>) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &Arc<MockNetwork> {
        &self.network
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    fn scheme(&self) -> &str {
        "mock"
    }

    async fn create(&self, uri: &str) -> TransportResult<Arc<dyn Transport>> {
        let uri = TransportUri::parse(uri)?;
        if uri.flag("failOnCreate") {
            return Err(TransportError::connect_failed(uri.as_str(), "failOnCreate"));
        }
        let broker = self.network.broker(&uri.address());
        Ok(MockTransport::new(&uri, Some(broker)))
    }
}

/// Listener that records every event for later assertions
#[derive(Debug, Default)]
pub struct RecordingListener {
    commands: Mutex<Vec<Command>>,
    exceptions: Mutex<Vec<TransportError>>,
    interrupted: AtomicUsize,
    resumed: AtomicUsize,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn exceptions(&self) -> Vec<TransportError> {
        self.exceptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn interrupted_count(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn resumed_count(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }
}

impl TransportListener for RecordingListener {
    fn on_command(&self, command: Command) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command);
    }

    fn on_exception(&self, error: TransportError) {
        self.exceptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(error);
    }

    fn transport_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::SeqCst);
    }

    fn transport_resumed(&self) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandBody, Message, ProducerId, SessionId, ConnectionId};
    use bytes::Bytes;

    fn mock(uri: &str, network: &Arc<MockNetwork>) -> Arc<MockTransport> {
        let uri = TransportUri::parse(uri).unwrap();
        let broker = network.broker(&uri.address());
        MockTransport::new(&uri, Some(broker))
    }

    fn message(id: i32) -> Command {
        Command::new(CommandBody::Message(Message {
            message_id: format!("m-{id}"),
            producer_id: ProducerId::new(SessionId::new(ConnectionId::from("ID:c"), 1), 1),
            destination: "queue://orders".to_string(),
            transaction_id: None,
            payload: Bytes::from_static(b"body"),
        }))
        .with_command_id(id)
    }

    #[tokio::test]
    async fn test_start_connects_to_broker() {
        // Arrange
        let network = MockNetwork::new();
        let transport = mock("mock://a:1", &network);

        // Act
        transport.start().await.unwrap();

        // Assert
        assert!(transport.is_connected());
        assert_eq!(network.broker("a:1").accepted_count(), 1);
        assert_eq!(network.broker("a:1").connection_count(), 1);
    }

    #[tokio::test]
    async fn test_stopped_broker_refuses_connection() {
        let network = MockNetwork::new();
        network.add_broker("a:1", false);
        let transport = mock("mock://a:1", &network);

        let result = transport.start().await;

        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_broker_stop_fails_transport_once() {
        let network = MockNetwork::new();
        let transport = mock("mock://a:1", &network);
        let listener = RecordingListener::new();
        transport.set_transport_listener(listener.clone());
        transport.start().await.unwrap();

        network.broker("a:1").stop();
        transport.fail("again");

        assert_eq!(listener.exceptions().len(), 1);
        assert!(!transport.is_connected());
        assert!(transport.oneway(message(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_response_required_commands_are_answered() {
        let network = MockNetwork::new();
        let transport = mock("mock://a:1?rejectCommand=KeepAlive", &network);
        let listener = RecordingListener::new();
        transport.set_transport_listener(listener.clone());
        transport.start().await.unwrap();

        transport
            .oneway(message(7).with_response_required())
            .await
            .unwrap();
        transport
            .oneway(
                Command::new(CommandBody::KeepAlive)
                    .with_command_id(8)
                    .with_response_required(),
            )
            .await
            .unwrap();

        let responses: Vec<Response> = listener
            .commands()
            .iter()
            .filter_map(|c| c.as_response().cloned())
            .collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0], Response::ok(7));
        assert!(responses[1].is_exception());
        assert_eq!(network.broker("a:1").received().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_on_send_message_after_count() {
        let network = MockNetwork::new();
        let transport = mock(
            "mock://a:1?failOnSendMessage=true&numSentMessageBeforeFail=2",
            &network,
        );
        transport.start().await.unwrap();

        assert!(transport.oneway(message(1)).await.is_ok());
        assert!(transport.oneway(message(2)).await.is_ok());
        assert!(transport.oneway(message(3)).await.is_err());
        assert_eq!(transport.sent_commands().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_on_start() {
        let network = MockNetwork::new();
        let transport = mock("mock://a:1?failOnStart=true", &network);

        assert!(transport.start().await.is_err());
        assert_eq!(network.broker("a:1").accepted_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_after_start_reports_failure() {
        let network = MockNetwork::new();
        let transport = mock("mock://a:1?failAfterStart=true", &network);
        let listener = RecordingListener::new();
        transport.set_transport_listener(listener.clone());

        let result = transport.start().await;

        assert!(result.is_ok());
        assert!(!transport.is_connected());
        assert_eq!(listener.exceptions().len(), 1);
    }

    #[tokio::test]
    async fn test_ignored_commands_get_no_response() {
        let network = MockNetwork::new();
        let transport = mock("mock://a:1?ignoreCommand=Message", &network);
        let listener = RecordingListener::new();
        transport.set_transport_listener(listener.clone());
        transport.start().await.unwrap();

        transport
            .oneway(message(3).with_response_required())
            .await
            .unwrap();

        assert!(listener.commands().is_empty());
        assert_eq!(network.broker("a:1").received().len(), 1);
    }

    #[tokio::test]
    async fn test_factory_fail_on_create() {
        let factory = MockTransportFactory::new(MockNetwork::new());

        let result = factory.create("mock://a:1?failOnCreate=true").await;

        assert!(matches!(result.err(), Some(TransportError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_close_disconnects_from_broker() {
        let network = MockNetwork::new();
        let transport = mock("mock://a:1?name=primary", &network);
        transport.start().await.unwrap();

        transport.close().await.unwrap();

        assert!(transport.is_closed());
        assert_eq!(transport.name(), "primary");
        assert_eq!(network.broker("a:1").connection_count(), 0);
        assert!(transport.start().await.is_err());
    }
}
