//! Observability for failover transports
//!
//! Structured logging setup and per-transport failover statistics.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{
    init_default_logging, init_from_section, init_logging, section_settings, LogFormat,
};
pub use metrics::{FailoverMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{backup_span, failover_span, reconnect_span};
