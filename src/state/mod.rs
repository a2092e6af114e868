//! Connection state tracking and replay

pub mod connection_state;
pub mod tracker;

pub use connection_state::{ConnectionState, SessionState, TransactionState};
pub use tracker::{ConnectionStateTracker, ReplayTarget, RestorePlan, RestoreReport, TrackerConfig};
