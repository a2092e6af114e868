//! In-process brokers for mock transports
//!
//! A [`MockNetwork`] maps `host:port` addresses to [`MockBroker`]s. Brokers
//! are created on first use in the running state, so a plain
//! `mock://host:port` URI always connects unless a test stops its broker.

use super::mocks::MockTransport;
use crate::error::{TransportError, TransportResult};
use crate::protocol::Command;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info};

static GLOBAL_NETWORK: Lazy<Arc<MockNetwork>> = Lazy::new(MockNetwork::new);

/// Set of named in-process brokers
#[derive(Debug, Default)]
pub struct MockNetwork {
    brokers: Mutex<HashMap<String, Arc<MockBroker>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide network used by the default registry
    pub fn global() -> Arc<Self> {
        GLOBAL_NETWORK.clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<MockBroker>>> {
        self.brokers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Broker at `address`, created running if unknown
    pub fn broker(&self, address: &str) -> Arc<MockBroker> {
        self.lock()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(MockBroker::new(address, true)))
            .clone()
    }

    /// Register a broker in the given state, replacing any previous one
    pub fn add_broker(&self, address: &str, running: bool) -> Arc<MockBroker> {
        let broker = Arc::new(MockBroker::new(address, running));
        self.lock().insert(address.to_string(), broker.clone());
        broker
    }

    pub fn find(&self, address: &str) -> Option<Arc<MockBroker>> {
        self.lock().get(address).cloned()
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

/// An in-process broker that accepts mock transport connections
#[derive(Debug)]
pub struct MockBroker {
    address: String,
    running: AtomicBool,
    accepted: AtomicUsize,
    connections: Mutex<Vec<Weak<MockTransport>>>,
    received: Mutex<Vec<Command>>,
}

impl MockBroker {
    pub fn new(address: &str, running: bool) -> Self {
        Self {
            address: address.to_string(),
            running: AtomicBool::new(running),
            accepted: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Mock broker {} started", self.address);
        }
    }

    /// Stop accepting and fail every connected transport
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Mock broker {} stopped", self.address);

        let connections: Vec<_> = self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for transport in connections.iter().filter_map(Weak::upgrade) {
            transport.fail(&format!("broker {} stopped", self.address));
        }
    }

    /// Total connections ever accepted
    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Transports currently connected and healthy
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|transport| transport.is_healthy())
            .count()
    }

    /// Every command delivered to this broker, across all connections
    pub fn received(&self) -> Vec<Command> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear_received(&self) {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub(crate) fn accept(&self, transport: &Arc<MockTransport>) -> TransportResult<()> {
        if !self.is_running() {
            return Err(TransportError::connect_failed(
                transport.uri().as_str(),
                format!("connection refused by {}", self.address),
            ));
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(transport));
        debug!("Mock broker {} accepted {}", self.address, transport.name());
        Ok(())
    }

    pub(crate) fn disconnect(&self, transport: &MockTransport) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|candidate| {
                candidate
                    .upgrade()
                    .map(|live| !std::ptr::eq(live.as_ref(), transport))
                    .unwrap_or(false)
            });
    }

    pub(crate) fn deliver(&self, command: &Command) {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.clone());
    }
}
