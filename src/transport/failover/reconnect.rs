//! Pure reconnect decision logic and failover connection states
//!
//! Nothing here touches the network or takes locks; the reconnect task feeds
//! in its counters and acts on the returned decision.

use crate::config::FailoverConfig;
use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};

/// Connection state of a failover transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverState {
    /// Created, not started
    Disconnected,
    /// Reconnect task is looking for a broker
    Connecting,
    /// Active transport restored and usable
    Connected,
    /// Active transport failed; callers wait for a reconnect
    Interrupted,
    /// Attempt limit exhausted; no further reconnects
    Failed(String),
    /// Closed by the client
    Closed,
}

impl FailoverState {
    /// Sends go straight to the active transport
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// No reconnect will ever happen again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Closed)
    }

    /// Log a state transition at the level its severity deserves
    pub fn log_transition(from: &FailoverState, to: &FailoverState) {
        match (from, to) {
            (Self::Connecting, Self::Connected) => info!("Failover transport connected"),
            (Self::Connected, Self::Interrupted) => warn!("Failover transport interrupted"),
            (Self::Interrupted, Self::Connected) => info!("Failover transport resumed"),
            (_, Self::Failed(reason)) => error!("Failover transport failed: {}", reason),
            (_, Self::Closed) => info!("Failover transport closed"),
            _ => info!("Failover transport state: {} -> {}", from, to),
        }
    }
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("DISCONNECTED"),
            Self::Connecting => f.write_str("CONNECTING"),
            Self::Connected => f.write_str("CONNECTED"),
            Self::Interrupted => f.write_str("INTERRUPTED"),
            Self::Failed(_) => f.write_str("FAILED"),
            Self::Closed => f.write_str("CLOSED"),
        }
    }
}

/// Decision result for a reconnect attempt
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Try again after `delay_ms`
    Proceed { attempt: u32, delay_ms: u64 },
    /// The transport was closed
    AbortClosed,
    /// The attempt limit is exhausted
    AbortMaxAttemptsExceeded { attempts: u32 },
}

/// Reconnect limits and backoff
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub back_off_multiplier: f64,
    pub use_exponential_back_off: bool,
    /// Retries after the first attempt once connected at least once
    pub max_attempts: Option<u32>,
    /// Retries before the first successful connect
    pub startup_max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&FailoverConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &FailoverConfig) -> Self {
        Self {
            initial_delay_ms: config.initial_reconnect_delay_ms,
            max_delay_ms: config.max_reconnect_delay_ms,
            back_off_multiplier: config.back_off_multiplier,
            use_exponential_back_off: config.use_exponential_back_off,
            max_attempts: config.max_reconnect_attempts,
            startup_max_attempts: config.startup_max_reconnect_attempts,
        }
    }

    /// Retry limit in force, None for unlimited
    pub fn attempt_limit(&self, first_connection: bool) -> Option<u32> {
        if first_connection {
            self.startup_max_attempts.or(self.max_attempts)
        } else {
            self.max_attempts
        }
    }

    /// Delay after the `failures`-th consecutive failure
    pub fn backoff_delay(&self, failures: u32) -> u64 {
        if !self.use_exponential_back_off || failures <= 1 {
            return self.initial_delay_ms.min(self.max_delay_ms);
        }

        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let delay = self.initial_delay_ms as f64 * self.back_off_multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            delay as u64
        }
    }

    /// Decide what follows `failures` consecutive failed attempts
    pub fn decide(&self, failures: u32, first_connection: bool, closed: bool) -> ReconnectionDecision {
        if closed {
            return ReconnectionDecision::AbortClosed;
        }

        if let Some(limit) = self.attempt_limit(first_connection) {
            if failures > limit {
                return ReconnectionDecision::AbortMaxAttemptsExceeded { attempts: failures };
            }
        }

        ReconnectionDecision::Proceed {
            attempt: failures + 1,
            delay_ms: self.backoff_delay(failures),
        }
    }
}
