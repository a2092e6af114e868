//! Failover transport
//!
//! - [`UriPool`]: candidate broker URIs and which of them are free
//! - [`BackupTransportPool`]: pre-connected standby transports
//! - [`CloseTransportsTask`]: closes discarded transports off the caller's path
//! - [`ReconnectPolicy`]: pure backoff and attempt-limit decisions
//! - [`FailoverTransport`]: the transport itself

pub mod backup_pool;
pub mod close_task;
pub mod factory;
pub mod reconnect;
pub mod transport;
pub mod uri_pool;

pub use backup_pool::{BackupEvents, BackupPoolConfig, BackupTransport, BackupTransportPool};
pub use close_task::CloseTransportsTask;
pub use factory::FailoverTransportFactory;
pub use reconnect::{FailoverState, ReconnectPolicy, ReconnectionDecision};
pub use transport::FailoverTransport;
pub use uri_pool::UriPool;
