//! Broker command model
//!
//! Resource identifiers and the commands that flow through transports. Wire
//! marshalling is out of scope; commands are plain values with serde support
//! for logging and tooling.

pub mod commands;
pub mod ids;

pub use commands::*;
pub use ids::*;
