//! Testing utilities and mock implementations
//!
//! Mock transports, in-process brokers and a recording listener, enough to
//! exercise failover end to end without a real broker.

pub mod mocks;
pub mod network;

pub use mocks::*;
pub use network::{MockBroker, MockNetwork};
