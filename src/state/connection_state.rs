//! Per-resource state records kept by the connection state tracker
//!
//! Each record holds the command that created the resource so it can be sent
//! again, unchanged, to a freshly connected broker.

use crate::protocol::{
    Command, CommandBody, ConsumerId, ConsumerInfo, ProducerId, SessionId, TransactionId,
    TransactionInfo, TransactionType,
};
use std::collections::BTreeMap;

/// Tracked state of one logical connection
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub(crate) info: Command,
    pub(crate) sessions: BTreeMap<SessionId, SessionState>,
    pub(crate) transactions: BTreeMap<TransactionId, TransactionState>,
    /// False between an interruption and the client's acknowledgement of it
    pub(crate) interrupt_processing_complete: bool,
    /// Consumers restored with prefetch zero, keyed to their original settings
    pub(crate) recovering_consumers: BTreeMap<ConsumerId, ConsumerInfo>,
}

impl ConnectionState {
    pub fn new(info: Command) -> Self {
        Self {
            info,
            sessions: BTreeMap::new(),
            transactions: BTreeMap::new(),
            interrupt_processing_complete: true,
            recovering_consumers: BTreeMap::new(),
        }
    }

    pub fn info(&self) -> &Command {
        &self.info
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionState> {
        self.sessions.values()
    }

    pub fn transactions(&self) -> impl Iterator<Item = &TransactionState> {
        self.transactions.values()
    }

    pub fn is_interrupt_processing_complete(&self) -> bool {
        self.interrupt_processing_complete
    }

    pub(crate) fn session_mut(&mut self, id: &SessionId) -> Option<&mut SessionState> {
        self.sessions.get_mut(id)
    }

    /// Look up the creating command of a live producer
    pub(crate) fn producer_info(&self, id: &ProducerId) -> Option<&Command> {
        self.sessions
            .get(&id.session_id)
            .and_then(|session| session.producers.get(id))
    }

    pub(crate) fn has_producer(&self, id: &ProducerId) -> bool {
        self.producer_info(id).is_some()
    }
}

/// Tracked state of one session
#[derive(Debug, Clone)]
pub struct SessionState {
    pub(crate) info: Command,
    pub(crate) producers: BTreeMap<ProducerId, Command>,
    pub(crate) consumers: BTreeMap<ConsumerId, Command>,
}

impl SessionState {
    pub fn new(info: Command) -> Self {
        Self {
            info,
            producers: BTreeMap::new(),
            consumers: BTreeMap::new(),
        }
    }

    pub fn info(&self) -> &Command {
        &self.info
    }

    pub fn producers(&self) -> impl Iterator<Item = &Command> {
        self.producers.values()
    }

    pub fn consumers(&self) -> impl Iterator<Item = &Command> {
        self.consumers.values()
    }
}

/// Tracked state of one open transaction
#[derive(Debug, Clone)]
pub struct TransactionState {
    pub(crate) id: TransactionId,
    pub(crate) commands: Vec<Command>,
    /// Producers that sent inside the transaction, kept even after removal
    pub(crate) producers: BTreeMap<ProducerId, Command>,
    /// Command id of the commit or rollback awaiting its response
    pub(crate) completion: Option<i32>,
}

impl TransactionState {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            commands: Vec::new(),
            producers: BTreeMap::new(),
            completion: None,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// The one-phase commit that was the last thing sent, if any
    ///
    /// Whether such a commit reached the broker cannot be known after a
    /// failure, so the transaction is not replayed.
    pub fn in_doubt_commit(&self) -> Option<&Command> {
        self.commands.last().filter(|command| {
            matches!(
                &command.body,
                CommandBody::TransactionInfo(TransactionInfo {
                    kind: TransactionType::CommitOnePhase,
                    ..
                })
            )
        })
    }
}
