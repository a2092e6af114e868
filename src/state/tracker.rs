//! Connection state tracker
//!
//! Records every state-mutating command a client sends so that a freshly
//! connected transport can be brought back to the same broker-side state.
//! Replay order follows creation dependencies: connection, sessions,
//! producers and consumers of each session, open transactions, then the
//! message and pull caches.

use super::connection_state::{ConnectionState, SessionState, TransactionState};
use crate::config::FailoverConfig;
use crate::error::TransportResult;
use crate::protocol::{
    Command, CommandBody, ConnectionId, ConsumerControl, ConsumerInfo, RemoveInfo, ResourceId,
    Response, TransactionType,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Destination of replayed commands during a restore
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    /// Send one replayed command; an error aborts the restore
    async fn replay(&self, command: Command) -> TransportResult<()>;
}

/// What the tracker records and replays
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub track_transactions: bool,
    pub track_messages: bool,
    pub track_transaction_producers: bool,
    pub max_cache_size: usize,
    pub max_pull_cache_size: usize,
    pub restore_sessions: bool,
    pub restore_consumers: bool,
    pub restore_producers: bool,
    pub restore_transactions: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            track_transactions: true,
            track_messages: false,
            track_transaction_producers: true,
            max_cache_size: 128 * 1024,
            max_pull_cache_size: 10,
            restore_sessions: true,
            restore_consumers: true,
            restore_producers: true,
            restore_transactions: true,
        }
    }
}

impl From<&FailoverConfig> for TrackerConfig {
    fn from(config: &FailoverConfig) -> Self {
        Self {
            track_messages: config.track_messages,
            track_transaction_producers: config.track_transaction_producers,
            max_cache_size: config.max_cache_size,
            max_pull_cache_size: config.max_pull_cache_size,
            ..Self::default()
        }
    }
}

/// Commands to send on a new transport plus answers to synthesize locally
#[derive(Debug, Default)]
pub struct RestorePlan {
    pub commands: Vec<Command>,
    /// Exception responses for commits whose outcome was lost with the old transport
    pub in_doubt: Vec<Response>,
}

/// Outcome of a successful restore
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub replayed: usize,
    pub in_doubt: Vec<Response>,
}

#[derive(Debug)]
struct CachedMessage {
    key: String,
    command: Command,
    size: usize,
}

#[derive(Debug, Default)]
struct TrackerState {
    connections: BTreeMap<ConnectionId, ConnectionState>,
    message_cache: VecDeque<CachedMessage>,
    message_cache_size: usize,
    pull_cache: VecDeque<(String, Command)>,
}

/// Records connection-scoped state and replays it onto new transports
#[derive(Debug)]
pub struct ConnectionStateTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl Default for ConnectionStateTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl ConnectionStateTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an outgoing command
    ///
    /// Returns true when the command's effect is covered by a later restore,
    /// meaning the sender does not need to resend it after a failure.
    pub fn track(&self, command: &Command) -> bool {
        let mut state = self.lock();
        match &command.body {
            CommandBody::ConnectionInfo(info) => {
                match state.connections.get_mut(&info.connection_id) {
                    Some(existing) => existing.info = command.clone(),
                    None => {
                        state.connections.insert(
                            info.connection_id.clone(),
                            ConnectionState::new(command.clone()),
                        );
                    }
                }
                true
            }
            CommandBody::SessionInfo(info) => {
                match state.connections.get_mut(&info.session_id.connection_id) {
                    Some(connection) => {
                        connection
                            .sessions
                            .entry(info.session_id.clone())
                            .and_modify(|session| session.info = command.clone())
                            .or_insert_with(|| SessionState::new(command.clone()));
                        true
                    }
                    None => false,
                }
            }
            CommandBody::ConsumerInfo(info) => state
                .connections
                .get_mut(info.consumer_id.connection_id())
                .and_then(|connection| connection.session_mut(&info.consumer_id.session_id))
                .map(|session| {
                    session
                        .consumers
                        .insert(info.consumer_id.clone(), command.clone());
                })
                .is_some(),
            CommandBody::ProducerInfo(info) => state
                .connections
                .get_mut(info.producer_id.connection_id())
                .and_then(|connection| connection.session_mut(&info.producer_id.session_id))
                .map(|session| {
                    session
                        .producers
                        .insert(info.producer_id.clone(), command.clone());
                })
                .is_some(),
            CommandBody::RemoveInfo(remove) => {
                Self::track_remove(&mut state, remove);
                true
            }
            CommandBody::TransactionInfo(info) => {
                if !self.config.track_transactions {
                    return false;
                }
                let Some(connection) = state.connections.get_mut(&info.connection_id) else {
                    return false;
                };
                if info.kind == TransactionType::Begin {
                    let mut transaction = TransactionState::new(info.transaction_id.clone());
                    transaction.commands.push(command.clone());
                    connection
                        .transactions
                        .insert(info.transaction_id.clone(), transaction);
                    return true;
                }
                match connection.transactions.get_mut(&info.transaction_id) {
                    Some(transaction) => {
                        transaction.commands.push(command.clone());
                        if info.kind.completes() {
                            transaction.completion = Some(command.command_id);
                        }
                        true
                    }
                    None => false,
                }
            }
            CommandBody::Message(message) => {
                let Some(transaction_id) = &message.transaction_id else {
                    return false;
                };
                if !self.config.track_transactions {
                    return false;
                }
                let Some(connection) = state.connections.get_mut(&transaction_id.connection_id)
                else {
                    return false;
                };
                let producer = if self.config.track_transaction_producers {
                    connection.producer_info(&message.producer_id).cloned()
                } else {
                    None
                };
                match connection.transactions.get_mut(transaction_id) {
                    Some(transaction) => {
                        transaction.commands.push(command.clone());
                        if let Some(producer) = producer {
                            transaction
                                .producers
                                .entry(message.producer_id.clone())
                                .or_insert(producer);
                        }
                        true
                    }
                    None => false,
                }
            }
            CommandBody::MessageAck(ack) => {
                let Some(transaction_id) = &ack.transaction_id else {
                    return false;
                };
                if !self.config.track_transactions {
                    return false;
                }
                match state
                    .connections
                    .get_mut(&transaction_id.connection_id)
                    .and_then(|connection| connection.transactions.get_mut(transaction_id))
                {
                    Some(transaction) => {
                        transaction.commands.push(command.clone());
                        true
                    }
                    None => false,
                }
            }
            CommandBody::MessagePull(pull) => {
                let key = format!("{}::{}", pull.destination, pull.consumer_id);
                state.pull_cache.retain(|(existing, _)| existing != &key);
                state.pull_cache.push_back((key, command.clone()));
                while state.pull_cache.len() > self.config.max_pull_cache_size {
                    state.pull_cache.pop_front();
                }
                false
            }
            _ => false,
        }
    }

    fn track_remove(state: &mut TrackerState, remove: &RemoveInfo) {
        match &remove.object_id {
            ResourceId::Connection(id) => {
                state.connections.remove(id);
            }
            ResourceId::Session(id) => {
                if let Some(connection) = state.connections.get_mut(&id.connection_id) {
                    connection.sessions.remove(id);
                    connection
                        .recovering_consumers
                        .retain(|consumer, _| &consumer.session_id != id);
                }
            }
            ResourceId::Consumer(id) => {
                if let Some(connection) = state.connections.get_mut(id.connection_id()) {
                    if let Some(session) = connection.session_mut(&id.session_id) {
                        session.consumers.remove(id);
                    }
                    connection.recovering_consumers.remove(id);
                }
            }
            ResourceId::Producer(id) => {
                if let Some(session) = state
                    .connections
                    .get_mut(id.connection_id())
                    .and_then(|connection| connection.session_mut(&id.session_id))
                {
                    session.producers.remove(id);
                }
            }
        }
    }

    /// Record a command after it was sent successfully
    pub fn track_back(&self, command: &Command) {
        if !self.config.track_messages {
            return;
        }
        let CommandBody::Message(message) = &command.body else {
            return;
        };
        if message.transaction_id.is_some() {
            return;
        }

        let mut state = self.lock();
        let key = message.message_id.clone();
        if let Some(position) = state.message_cache.iter().position(|m| m.key == key) {
            if let Some(previous) = state.message_cache.remove(position) {
                state.message_cache_size -= previous.size;
            }
        }

        let size = message.size();
        state.message_cache_size += size;
        state.message_cache.push_back(CachedMessage {
            key,
            command: command.clone(),
            size,
        });

        while state.message_cache_size > self.config.max_cache_size {
            match state.message_cache.pop_front() {
                Some(evicted) => {
                    state.message_cache_size -= evicted.size;
                    debug!("Evicted message {} from the replay cache", evicted.key);
                }
                None => break,
            }
        }
    }

    /// A response arrived; finish any transaction it completes
    pub fn on_response(&self, correlation_id: i32) {
        let mut state = self.lock();
        for connection in state.connections.values_mut() {
            connection
                .transactions
                .retain(|_, transaction| transaction.completion != Some(correlation_id));
        }
    }

    /// Mark every connection as awaiting interruption processing
    pub fn transport_interrupted(&self) {
        let mut state = self.lock();
        for connection in state.connections.values_mut() {
            connection.interrupt_processing_complete = false;
        }
    }

    /// The client finished handling an interruption for `connection_id`
    ///
    /// Returns the consumer controls that give stalled consumers their
    /// original prefetch back.
    pub fn connection_interrupt_processing_complete(
        &self,
        connection_id: &ConnectionId,
    ) -> Vec<Command> {
        let mut state = self.lock();
        let Some(connection) = state.connections.get_mut(connection_id) else {
            return Vec::new();
        };

        connection.interrupt_processing_complete = true;
        let stalled = std::mem::take(&mut connection.recovering_consumers);
        if !stalled.is_empty() {
            info!(
                "Restoring prefetch of {} stalled consumer(s) on {}",
                stalled.len(),
                connection_id
            );
        }

        stalled
            .into_values()
            .map(|info| {
                Command::new(CommandBody::ConsumerControl(ConsumerControl {
                    consumer_id: info.consumer_id,
                    destination: info.destination,
                    prefetch: info.prefetch_size,
                }))
            })
            .collect()
    }

    pub fn is_connection_interrupt_processing_complete(&self, connection_id: &ConnectionId) -> bool {
        self.lock()
            .connections
            .get(connection_id)
            .map(ConnectionState::is_interrupt_processing_complete)
            .unwrap_or(true)
    }

    /// Build the ordered list of commands that recreates the tracked state
    pub fn restore_plan(&self) -> RestorePlan {
        let mut state = self.lock();
        let mut plan = RestorePlan::default();

        for connection in state.connections.values_mut() {
            plan.commands.push(connection.info.clone());

            if self.config.restore_sessions {
                self.plan_sessions(connection, &mut plan);
            }

            if self.config.restore_transactions {
                Self::plan_transactions(connection, &mut plan);
            }
        }

        plan.commands
            .extend(state.message_cache.iter().map(|m| m.command.clone()));
        plan.commands
            .extend(state.pull_cache.iter().map(|(_, command)| command.clone()));

        plan
    }

    fn plan_sessions(&self, connection: &mut ConnectionState, plan: &mut RestorePlan) {
        let stall_consumers = !connection.interrupt_processing_complete;
        let mut stalled = Vec::new();

        for session in connection.sessions.values() {
            plan.commands.push(session.info.clone());

            if self.config.restore_producers {
                plan.commands.extend(session.producers.values().cloned());
            }

            if self.config.restore_consumers {
                for command in session.consumers.values() {
                    match &command.body {
                        CommandBody::ConsumerInfo(info) if stall_consumers && info.prefetch_size > 0 => {
                            let mut stalled_command = command.clone();
                            stalled_command.body = CommandBody::ConsumerInfo(ConsumerInfo {
                                prefetch_size: 0,
                                ..info.clone()
                            });
                            stalled.push(info.clone());
                            plan.commands.push(stalled_command);
                        }
                        _ => plan.commands.push(command.clone()),
                    }
                }
            }
        }

        for info in stalled {
            connection
                .recovering_consumers
                .insert(info.consumer_id.clone(), info);
        }
    }

    fn plan_transactions(connection: &ConnectionState, plan: &mut RestorePlan) {
        for transaction in connection.transactions.values() {
            if let Some(commit) = transaction.in_doubt_commit() {
                plan.in_doubt.push(Response::exception(
                    commit.command_id,
                    format!(
                        "Transaction completion in doubt due to failover. Forcing rollback of {}",
                        transaction.id
                    ),
                ));
                continue;
            }

            let removed_producers: Vec<_> = transaction
                .producers
                .iter()
                .filter(|(id, _)| !connection.has_producer(id))
                .collect();

            plan.commands
                .extend(removed_producers.iter().map(|(_, command)| (*command).clone()));
            plan.commands.extend(transaction.commands.iter().cloned());
            plan.commands.extend(removed_producers.iter().map(|(id, _)| {
                Command::new(CommandBody::RemoveInfo(RemoveInfo {
                    object_id: ResourceId::Producer((*id).clone()),
                }))
            }));
        }
    }

    /// Replay the tracked state onto `target`
    pub async fn restore(&self, target: &dyn ReplayTarget) -> TransportResult<RestoreReport> {
        let plan = self.restore_plan();
        let mut replayed = 0;

        for command in plan.commands {
            debug!("Restoring {} (id {})", command.kind(), command.command_id);
            target.replay(command).await?;
            replayed += 1;
        }

        Ok(RestoreReport {
            replayed,
            in_doubt: plan.in_doubt,
        })
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.lock().connections.keys().cloned().collect()
    }

    pub fn has_state(&self) -> bool {
        let state = self.lock();
        !state.connections.is_empty()
            || !state.message_cache.is_empty()
            || !state.pull_cache.is_empty()
    }

    pub fn session_count(&self) -> usize {
        self.lock()
            .connections
            .values()
            .map(|connection| connection.sessions.len())
            .sum()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock()
            .connections
            .values()
            .flat_map(|connection| connection.sessions.values())
            .map(|session| session.consumers.len())
            .sum()
    }

    pub fn producer_count(&self) -> usize {
        self.lock()
            .connections
            .values()
            .flat_map(|connection| connection.sessions.values())
            .map(|session| session.producers.len())
            .sum()
    }

    pub fn transaction_count(&self) -> usize {
        self.lock()
            .connections
            .values()
            .map(|connection| connection.transactions.len())
            .sum()
    }

    pub fn cached_message_count(&self) -> usize {
        self.lock().message_cache.len()
    }

    pub fn cached_pull_count(&self) -> usize {
        self.lock().pull_cache.len()
    }

    pub fn clear(&self) {
        *self.lock() = TrackerState::default();
    }
}
