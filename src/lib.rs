//! Broker Failover - fault tolerant messaging transport
//!
//! A transport that keeps a client's broker connection alive across broker
//! failures. It reconnects through a pool of candidate URIs, replays the
//! client's connection state (sessions, producers, consumers, open
//! transactions) onto the new connection and only then releases callers that
//! were blocked while the link was down.
//!
//! # Overview
//!
//! - [`transport::failover`]: the failover transport, its URI pool, backup
//!   transports and reconnect policy
//! - [`state`]: connection state tracking and replay
//! - [`task`]: the cooperative background task runner
//! - [`protocol`]: the command model exchanged with brokers
//! - [`testing`]: in-process mock brokers and transports
//!
//! # Quick Start
//!
//! ```rust
//! use broker_failover::protocol::{Command, CommandBody, ConnectionId, ConnectionInfo};
//! use broker_failover::testing::MockNetwork;
//! use broker_failover::transport::{Transport, TransportRegistry};
//!
//! # tokio_test::block_on(async {
//! let registry = TransportRegistry::with_mock_network(MockNetwork::new());
//! let transport = registry
//!     .create("failover:(mock://broker-a:61616,mock://broker-b:61616)?randomize=false")
//!     .await
//!     .unwrap();
//! transport.start().await.unwrap();
//!
//! let info = ConnectionInfo::new(ConnectionId::from("conn-1"), "client-1");
//! let response = transport
//!     .request(Command::new(CommandBody::ConnectionInfo(info)), None)
//!     .await
//!     .unwrap();
//! assert!(!response.is_exception());
//!
//! transport.close().await.unwrap();
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod state;
pub mod task;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError, FailoverConfig};
pub use error::{TransportError, TransportResult};
pub use state::ConnectionStateTracker;
pub use transport::failover::{FailoverState, FailoverTransport};
pub use transport::{Transport, TransportListener, TransportRegistry};
