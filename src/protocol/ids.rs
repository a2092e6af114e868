//! Identifiers for connection-scoped broker resources
//!
//! Identifiers nest the way the resources do: a session belongs to a
//! connection, consumers and producers belong to a session.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a logical client connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a fresh, globally unique connection id
    pub fn generate() -> Self {
        Self(format!("ID:{}", Uuid::new_v4()))
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a session within a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub connection_id: ConnectionId,
    pub value: i64,
}

impl SessionId {
    pub fn new(connection_id: ConnectionId, value: i64) -> Self {
        Self {
            connection_id,
            value,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.value)
    }
}

/// Identifier of a consumer within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId {
    pub session_id: SessionId,
    pub value: i64,
}

impl ConsumerId {
    pub fn new(session_id: SessionId, value: i64) -> Self {
        Self { session_id, value }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.session_id.connection_id
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.value)
    }
}

/// Identifier of a producer within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId {
    pub session_id: SessionId,
    pub value: i64,
}

impl ProducerId {
    pub fn new(session_id: SessionId, value: i64) -> Self {
        Self { session_id, value }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.session_id.connection_id
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.value)
    }
}

/// Identifier of a local transaction within a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    pub connection_id: ConnectionId,
    pub value: i64,
}

impl TransactionId {
    pub fn new(connection_id: ConnectionId, value: i64) -> Self {
        Self {
            connection_id,
            value,
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TX:{}:{}", self.connection_id, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_connection_ids_are_unique() {
        let first = ConnectionId::generate();
        let second = ConnectionId::generate();

        assert_ne!(first, second);
        assert!(first.0.starts_with("ID:"));
    }

    #[test]
    fn test_nested_ids_display() {
        let session = SessionId::new(ConnectionId::from("ID:c1"), 2);
        let consumer = ConsumerId::new(session.clone(), 7);
        let producer = ProducerId::new(session, 3);

        assert_eq!(consumer.to_string(), "ID:c1:2:7");
        assert_eq!(producer.to_string(), "ID:c1:2:3");
        assert_eq!(consumer.connection_id(), &ConnectionId::from("ID:c1"));
    }
}
