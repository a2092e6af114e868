//! Error types for the failover transport stack
//!
//! Every transport operation returns [`TransportResult`]. The error is `Clone`
//! so a single exhaustion failure can be handed to every blocked caller and to
//! the transport listener.

use thiserror::Error;

/// Main error type for transport operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("Transport is closed")]
    Closed,

    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Failed to connect to {uri}: {reason}")]
    ConnectFailed { uri: String, reason: String },

    #[error("Failed to connect after {attempts} attempt(s): {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("State restore failed: {reason}")]
    RestoreFailed { reason: String },

    #[error("Broker error: {message}")]
    Broker { message: String },

    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("No transport factory registered for scheme '{scheme}'")]
    UnknownScheme { scheme: String },

    #[error("Operation not supported: {operation}")]
    Unsupported { operation: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Create I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create connect failure
    pub fn connect_failed<U: Into<String>, R: Into<String>>(uri: U, reason: R) -> Self {
        Self::ConnectFailed {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Create restore failure
    pub fn restore_failed<S: Into<String>>(reason: S) -> Self {
        Self::RestoreFailed {
            reason: reason.into(),
        }
    }

    /// Create broker error from an exception response
    pub fn broker<S: Into<String>>(message: S) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    /// Create invalid URI error
    pub fn invalid_uri<U: Into<String>, R: Into<String>>(uri: U, reason: R) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Create unsupported operation error
    pub fn unsupported<S: Into<String>>(operation: S) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// True for failures a client must treat as I/O failures of the logical connection
    pub fn is_io_kind(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Closed
                | Self::Timeout { .. }
                | Self::ConnectFailed { .. }
                | Self::ReconnectExhausted { .. }
                | Self::RestoreFailed { .. }
        )
    }

    /// True for the distinguished outcome of an explicit close
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// True when the error came from a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<crate::config::ConfigError> for TransportError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
