//! Command model carried by transports
//!
//! Commands are opaque units of work as far as the transport layer is
//! concerned. The variants here are the ones the failover layer and the
//! connection state tracker need to recognise: resource setup and teardown,
//! transaction boundaries, messages, acknowledgements and broker control.

use super::ids::{ConnectionId, ConsumerId, ProducerId, SessionId, TransactionId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single command exchanged with a broker
///
/// # Examples
/// ```
/// use broker_failover::protocol::{Command, CommandBody, ConnectionId, ConnectionInfo};
///
/// let info = ConnectionInfo::new(ConnectionId::from("ID:client-1"), "client-1");
/// let command = Command::new(CommandBody::ConnectionInfo(info)).with_response_required();
///
/// assert!(command.response_required);
/// assert_eq!(command.kind(), "ConnectionInfo");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    /// Correlation id assigned by the sending transport when zero
    pub command_id: i32,
    /// Whether the broker must answer with a [`Response`]
    pub response_required: bool,
    pub body: CommandBody,
}

/// Payload of a command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandBody {
    ConnectionInfo(ConnectionInfo),
    SessionInfo(SessionInfo),
    ConsumerInfo(ConsumerInfo),
    ProducerInfo(ProducerInfo),
    RemoveInfo(RemoveInfo),
    TransactionInfo(TransactionInfo),
    Message(Message),
    MessageAck(MessageAck),
    MessagePull(MessagePull),
    ConsumerControl(ConsumerControl),
    ConnectionControl(ConnectionControl),
    Response(Response),
    ShutdownInfo,
    KeepAlive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id: String,
    #[serde(default)]
    pub fault_tolerant: bool,
}

impl ConnectionInfo {
    pub fn new<S: Into<String>>(connection_id: ConnectionId, client_id: S) -> Self {
        Self {
            connection_id,
            client_id: client_id.into(),
            fault_tolerant: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub destination: String,
    /// Number of messages the broker may push ahead of acknowledgement
    pub prefetch_size: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub destination: Option<String>,
}

/// Resource addressed by a [`RemoveInfo`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResourceId {
    Connection(ConnectionId),
    Session(SessionId),
    Consumer(ConsumerId),
    Producer(ProducerId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoveInfo {
    pub object_id: ResourceId,
}

/// Transaction boundary carried by a [`TransactionInfo`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Begin,
    Prepare,
    End,
    CommitOnePhase,
    CommitTwoPhase,
    Rollback,
    Forget,
}

impl TransactionType {
    /// True for boundaries that finish the transaction once the broker answers
    pub fn completes(&self) -> bool {
        matches!(
            self,
            Self::CommitOnePhase | Self::CommitTwoPhase | Self::Rollback | Self::Forget
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionInfo {
    pub connection_id: ConnectionId,
    pub transaction_id: TransactionId,
    pub kind: TransactionType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub producer_id: ProducerId,
    pub destination: String,
    pub transaction_id: Option<TransactionId>,
    pub payload: Bytes,
}

impl Message {
    /// Size used for message cache accounting
    pub fn size(&self) -> usize {
        self.payload.len() + self.message_id.len() + self.destination.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageAck {
    pub consumer_id: ConsumerId,
    pub destination: String,
    pub transaction_id: Option<TransactionId>,
    pub message_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePull {
    pub consumer_id: ConsumerId,
    pub destination: String,
    /// Pull timeout in milliseconds, zero means no wait
    pub timeout_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerControl {
    pub consumer_id: ConsumerId,
    pub destination: String,
    pub prefetch: i32,
}

/// Broker-pushed control of the client connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionControl {
    /// Broker asks the client to move to this URI
    pub reconnect_to: Option<String>,
    /// Broker asks the client to rebalance onto the updated broker list
    #[serde(default)]
    pub rebalance_connection: bool,
    /// Comma separated list of brokers currently in the cluster
    pub connected_brokers: Option<String>,
}

/// Broker answer correlated to a response-required command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub correlation_id: i32,
    /// Present when the broker rejected the command
    pub exception: Option<String>,
}

impl Response {
    pub fn ok(correlation_id: i32) -> Self {
        Self {
            correlation_id,
            exception: None,
        }
    }

    pub fn exception<S: Into<String>>(correlation_id: i32, message: S) -> Self {
        Self {
            correlation_id,
            exception: Some(message.into()),
        }
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }
}

impl Command {
    /// Create a command with no id assigned yet
    pub fn new(body: CommandBody) -> Self {
        Self {
            command_id: 0,
            response_required: false,
            body,
        }
    }

    pub fn with_response_required(mut self) -> Self {
        self.response_required = true;
        self
    }

    pub fn with_command_id(mut self, command_id: i32) -> Self {
        self.command_id = command_id;
        self
    }

    /// Build a response command for the given correlation id
    pub fn response(response: Response) -> Self {
        Self::new(CommandBody::Response(response))
    }

    /// Short name of the command kind, used in logs and by mock options
    pub fn kind(&self) -> &'static str {
        match &self.body {
            CommandBody::ConnectionInfo(_) => "ConnectionInfo",
            CommandBody::SessionInfo(_) => "SessionInfo",
            CommandBody::ConsumerInfo(_) => "ConsumerInfo",
            CommandBody::ProducerInfo(_) => "ProducerInfo",
            CommandBody::RemoveInfo(_) => "RemoveInfo",
            CommandBody::TransactionInfo(_) => "TransactionInfo",
            CommandBody::Message(_) => "Message",
            CommandBody::MessageAck(_) => "MessageAck",
            CommandBody::MessagePull(_) => "MessagePull",
            CommandBody::ConsumerControl(_) => "ConsumerControl",
            CommandBody::ConnectionControl(_) => "ConnectionControl",
            CommandBody::Response(_) => "Response",
            CommandBody::ShutdownInfo => "ShutdownInfo",
            CommandBody::KeepAlive => "KeepAlive",
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self.body, CommandBody::Response(_))
    }

    pub fn is_message(&self) -> bool {
        matches!(self.body, CommandBody::Message(_))
    }

    /// Resource setup commands that the broker must acknowledge on replay
    pub fn is_resource_info(&self) -> bool {
        matches!(
            self.body,
            CommandBody::ConnectionInfo(_)
                | CommandBody::SessionInfo(_)
                | CommandBody::ConsumerInfo(_)
                | CommandBody::ProducerInfo(_)
        )
    }

    pub fn as_response(&self) -> Option<&Response> {
        match &self.body {
            CommandBody::Response(response) => Some(response),
            _ => None,
        }
    }
}
