//! Fault tolerant transport over a pool of broker URIs
//!
//! One physical transport is active at a time. When it fails, the reconnect
//! task (a [`CompositeTask`] on this transport's runner) picks the next
//! candidate, connects, replays the tracked connection state and only then
//! releases callers blocked in `oneway`/`request`.
//!
//! Every physical transport is tagged with a generation number. Failure
//! reports from a transport that is no longer active are ignored, and
//! requests remember the generation they were sent on so that unanswered
//! ones can be sent again after a reconnect.

use super::backup_pool::{BackupEvents, BackupPoolConfig, BackupTransport, BackupTransportPool};
use super::close_task::CloseTransportsTask;
use super::reconnect::{FailoverState, ReconnectPolicy, ReconnectionDecision};
use super::uri_pool::UriPool;
use crate::config::FailoverConfig;
use crate::error::{TransportError, TransportResult};
use crate::observability::{FailoverMetrics, MetricsSnapshot};
use crate::protocol::{Command, CommandBody, ConnectionControl, ConnectionId, Response};
use crate::state::{ConnectionStateTracker, ReplayTarget, TrackerConfig};
use crate::task::{CompositeTask, CompositeTaskRunner};
use crate::transport::uri::CompositeUri;
use crate::transport::{
    DefaultTransportListener, FutureResponse, ResponseCallback, ResponseSender, Transport,
    TransportListener, TransportRegistry,
};
use crate::{failover_span, reconnect_span};
use async_trait::async_trait;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

const RUNNER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// The physical transport currently in use
struct ActiveTransport {
    transport: Arc<dyn Transport>,
    uri: String,
    generation: u64,
}

/// Reconnect work requested while a transport is active
#[derive(Debug, Clone, PartialEq)]
enum ReconnectRequest {
    /// Drop the current broker and pick again
    Rebalance,
    /// Move to this broker
    Target(String),
}

/// What one reconnect iteration is going to do
enum ReconnectPlan {
    Connect { target: Option<String> },
    Switch { target: Option<String> },
    PromotePriority,
}

/// Where the next connection comes from
enum Candidate {
    Backup(BackupTransport),
    Uri(String),
}

impl Candidate {
    fn uri(&self) -> &str {
        match self {
            Candidate::Backup(backup) => &backup.uri,
            Candidate::Uri(uri) => uri,
        }
    }
}

struct ReconnectState {
    started: bool,
    closed: bool,
    active: Option<ActiveTransport>,
    /// Last generation handed out
    generation: u64,
    /// Generation whose transport failed before it could be activated
    failed_generation: Option<u64>,
    connect_failures: u32,
    first_connection: bool,
    failure: Option<TransportError>,
    request: Option<ReconnectRequest>,
    /// No reconnect attempt before this instant
    retry_at: Option<Instant>,
    /// Connections whose client has not finished handling the last interruption
    pending_interrupt: BTreeSet<ConnectionId>,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self {
            started: false,
            closed: false,
            active: None,
            generation: 0,
            failed_generation: None,
            connect_failures: 0,
            first_connection: true,
            failure: None,
            request: None,
            retry_at: None,
            pending_interrupt: BTreeSet::new(),
        }
    }
}

/// A response-required command waiting for its answer
struct PendingRequest {
    command: Command,
    /// Generation the command was last handed to, None while the caller resends
    sent_generation: Option<u64>,
    /// The tracker covers this command on restore
    tracked: bool,
    responder: Option<ResponseSender>,
    callback: Option<Arc<dyn ResponseCallback>>,
}

impl PendingRequest {
    fn complete(self, response: Response) {
        if let Some(callback) = &self.callback {
            callback.on_complete(&response);
        }
        let result = match &response.exception {
            Some(message) => Err(TransportError::broker(message.clone())),
            None => Ok(response),
        };
        if let Some(responder) = self.responder {
            let _ = responder.send(result);
        }
    }

    fn fail(self, error: TransportError) {
        if let Some(responder) = self.responder {
            let _ = responder.send(Err(error));
        }
    }
}

/// Fault tolerant transport that fails over between brokers
pub struct FailoverTransport {
    this: Weak<FailoverTransport>,
    config: FailoverConfig,
    policy: ReconnectPolicy,
    registry: Arc<TransportRegistry>,
    uris: Arc<UriPool>,
    tracker: ConnectionStateTracker,
    backups: Arc<BackupTransportPool>,
    close_task: Arc<CloseTransportsTask>,
    runner: CompositeTaskRunner,
    state_tx: watch::Sender<FailoverState>,
    reconnect: Mutex<ReconnectState>,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    requests: Mutex<HashMap<i32, PendingRequest>>,
    restore_waiters: Mutex<HashMap<i32, oneshot::Sender<Response>>>,
    next_command_id: AtomicI32,
    connected_to_priority: AtomicBool,
    /// URIs most recently pushed by a broker
    updated_uris: Mutex<Vec<String>>,
    metrics: FailoverMetrics,
}

impl FailoverTransport {
    /// Create an unstarted failover transport
    pub fn new(
        config: FailoverConfig,
        registry: Arc<TransportRegistry>,
    ) -> TransportResult<Arc<Self>> {
        config.validate()?;

        let runner = CompositeTaskRunner::new("failover");
        let close_task = Arc::new(CloseTransportsTask::new(runner.waker()));
        let uris = Arc::new(UriPool::new(
            config.uris.iter().cloned(),
            config.priority_uris.iter().cloned(),
            config.randomize,
        ));
        let (state_tx, _) = watch::channel(FailoverState::Disconnected);

        let transport = Arc::new_cyclic(|this: &Weak<FailoverTransport>| {
            let events: Weak<dyn BackupEvents> = this.clone();
            let backups = BackupTransportPool::new(
                BackupPoolConfig::from(&config),
                uris.clone(),
                registry.clone(),
                runner.waker(),
                close_task.clone(),
                events,
            );

            runner.add_task(Arc::new(ReconnectTask {
                transport: this.clone(),
            }));
            runner.add_task(backups.clone());
            runner.add_task(close_task.clone());

            Self {
                this: this.clone(),
                policy: ReconnectPolicy::from_config(&config),
                tracker: ConnectionStateTracker::new(TrackerConfig::from(&config)),
                config,
                registry,
                uris,
                backups,
                close_task,
                runner,
                state_tx,
                reconnect: Mutex::new(ReconnectState::default()),
                listener: RwLock::new(None),
                requests: Mutex::new(HashMap::new()),
                restore_waiters: Mutex::new(HashMap::new()),
                next_command_id: AtomicI32::new(1),
                connected_to_priority: AtomicBool::new(false),
                updated_uris: Mutex::new(Vec::new()),
                metrics: FailoverMetrics::new(),
            }
        });

        info!(
            "Created failover transport over {} URI(s)",
            transport.uris.len()
        );
        Ok(transport)
    }

    /// Create from a `failover://(uri1,uri2)?options` URI
    pub fn from_uri(uri: &str, registry: Arc<TransportRegistry>) -> TransportResult<Arc<Self>> {
        let composite = CompositeUri::parse(uri)?;
        let config = FailoverConfig::from_uri_options(composite.components, &composite.options)?;
        Self::new(config, registry)
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn state(&self) -> FailoverState {
        self.state_tx.borrow().clone()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<FailoverState> {
        self.state_tx.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn state_tracker(&self) -> &ConnectionStateTracker {
        &self.tracker
    }

    pub fn uri_pool(&self) -> &UriPool {
        &self.uris
    }

    pub fn backup_count(&self) -> usize {
        self.backups.backup_count()
    }

    /// URI of the active transport
    pub fn connected_uri(&self) -> Option<String> {
        self.lock().active.as_ref().map(|active| active.uri.clone())
    }

    /// Connected, and to a priority broker
    pub fn is_connected_to_priority(&self) -> bool {
        self.is_connected() && self.connected_to_priority.load(Ordering::SeqCst)
    }

    /// Connections still waiting for `set_connection_interrupt_processing_complete`
    pub fn connections_pending_interrupt_processing(&self) -> Vec<ConnectionId> {
        self.lock().pending_interrupt.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, ReconnectState> {
        self.reconnect.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn requests(&self) -> MutexGuard<'_, HashMap<i32, PendingRequest>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn restore_waiters(&self) -> MutexGuard<'_, HashMap<i32, oneshot::Sender<Response>>> {
        self.restore_waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listener(&self) -> Arc<dyn TransportListener> {
        self.listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultTransportListener))
    }

    fn set_state(&self, next: FailoverState) {
        self.state_tx.send_if_modified(|current| {
            let allowed = match current {
                FailoverState::Closed => false,
                FailoverState::Failed(_) => next == FailoverState::Closed,
                _ => true,
            };
            if !allowed || *current == next {
                return false;
            }
            FailoverState::log_transition(current, &next);
            *current = next;
            true
        });
    }

    fn assign_id(&self, mut command: Command) -> Command {
        if command.command_id == 0 {
            command.command_id = self.next_command_id.fetch_add(1, Ordering::SeqCst);
        }
        command
    }

    /// Ask for a new connection; with `rebalance` the current one is dropped
    pub fn request_reconnect(&self, rebalance: bool) {
        {
            let mut state = self.lock();
            if state.closed || state.failure.is_some() {
                return;
            }
            if rebalance && state.active.is_some() {
                state.request = Some(ReconnectRequest::Rebalance);
            }
            state.retry_at = None;
        }
        self.runner.wakeup();
    }

    /// Move to `uri`, adding it to the pool if it is new
    pub fn reconnect_to(&self, uri: &str) {
        let uri = uri.trim();
        if uri.is_empty() {
            return;
        }
        {
            let mut state = self.lock();
            if state.closed || state.failure.is_some() {
                return;
            }
            if state.active.as_ref().map(|active| active.uri == uri).unwrap_or(false) {
                debug!("Already connected to {}", uri);
                return;
            }
            state.request = Some(ReconnectRequest::Target(uri.to_string()));
            state.retry_at = None;
        }
        self.uris.add_uri(uri);
        self.runner.wakeup();
    }

    /// Add candidate URIs
    ///
    /// With `rebalance`, a reconnect is forced when the connected URI is among them.
    pub fn add_uris(&self, rebalance: bool, uris: &[String]) {
        for uri in uris {
            self.uris.add_uri(uri);
        }
        self.rebalance_if_affected(rebalance, uris);
        self.runner.wakeup();
    }

    /// Remove candidate URIs
    ///
    /// With `rebalance`, a reconnect is forced when the connected URI is removed.
    pub fn remove_uris(&self, rebalance: bool, uris: &[String]) {
        for uri in uris {
            self.uris.remove_uri(uri);
        }
        self.rebalance_if_affected(rebalance, uris);
    }

    fn rebalance_if_affected(&self, rebalance: bool, uris: &[String]) {
        if !rebalance {
            return;
        }
        let connected = self.connected_uri();
        if connected.map(|uri| uris.contains(&uri)).unwrap_or(false) {
            self.request_reconnect(true);
        }
    }

    /// Replace the broker-pushed URIs
    ///
    /// URIs learned from an earlier update that are neither configured nor
    /// in the new list leave the pool.
    pub fn apply_updated_uris(&self, rebalance: bool, uris: &[String]) {
        {
            let mut updated = self.updated_uris.lock().unwrap_or_else(|e| e.into_inner());
            for previous in updated.iter() {
                if !uris.contains(previous) && !self.config.uris.contains(previous) {
                    self.uris.remove_uri(previous);
                }
            }
            for uri in uris {
                self.uris.add_uri(uri);
            }
            *updated = uris.to_vec();
        }
        info!("Broker URI list updated: {:?}", uris);

        if rebalance {
            self.request_reconnect(true);
        } else {
            self.runner.wakeup();
        }
    }

    /// React to a broker-pushed connection control
    pub fn handle_connection_control(&self, control: &ConnectionControl) {
        if let Some(uri) = control.reconnect_to.as_deref().filter(|uri| !uri.is_empty()) {
            if self.config.reconnect_supported {
                info!("Broker requested reconnect to {}", uri);
                self.reconnect_to(uri);
            } else {
                debug!("Ignoring reconnect request to {}", uri);
            }
        }

        if let Some(brokers) = &control.connected_brokers {
            if self.config.update_uris_supported {
                let uris: Vec<String> = brokers
                    .split(',')
                    .map(str::trim)
                    .filter(|uri| !uri.is_empty())
                    .map(str::to_string)
                    .collect();
                let rebalance = control.rebalance_connection && self.config.rebalance_update_uris;
                self.apply_updated_uris(rebalance, &uris);
            }
        }
    }

    /// The client finished handling an interruption of `connection_id`
    ///
    /// Stalled consumers get their prefetch back when connected; otherwise
    /// the next restore uses the original prefetch.
    pub async fn set_connection_interrupt_processing_complete(&self, connection_id: &ConnectionId) {
        let controls = self
            .tracker
            .connection_interrupt_processing_complete(connection_id);
        self.lock().pending_interrupt.remove(connection_id);

        let Some((transport, _)) = self.active_transport() else {
            return;
        };
        for control in controls {
            let control = self.assign_id(control);
            if let Err(e) = transport.oneway(control).await {
                warn!("Failed to restore consumer prefetch: {}", e);
                return;
            }
        }
    }

    fn active_transport(&self) -> Option<(Arc<dyn Transport>, u64)> {
        self.lock()
            .active
            .as_ref()
            .map(|active| (active.transport.clone(), active.generation))
    }

    /// Wait until a transport is active, the transport ends, or `deadline`
    async fn wait_for_transport(
        &self,
        deadline: Option<Instant>,
    ) -> TransportResult<(Arc<dyn Transport>, u64)> {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            {
                let state = self.lock();
                if state.closed {
                    return Err(TransportError::Closed);
                }
                if let Some(failure) = &state.failure {
                    return Err(failure.clone());
                }
                if let Some(active) = &state.active {
                    return Ok((active.transport.clone(), active.generation));
                }
            }

            let changed = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, state_rx.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => {
                        return Err(TransportError::timeout(
                            "connection",
                            self.config.timeout_ms.unwrap_or_default(),
                        ))
                    }
                },
                None => state_rx.changed().await,
            };
            if changed.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Answer commands that make no sense to send while disconnected
    ///
    /// Returns true when the command was fully handled locally.
    fn handle_while_disconnected(&self, command: &Command) -> bool {
        if self.lock().active.is_some() {
            return false;
        }
        match &command.body {
            CommandBody::ShutdownInfo | CommandBody::MessagePull(_) => {
                debug!("Dropping {} while disconnected", command.kind());
                if command.response_required {
                    self.dispatch_response(Response::ok(command.command_id));
                }
                true
            }
            CommandBody::RemoveInfo(_) | CommandBody::MessageAck(_) => {
                self.tracker.track(command);
                if command.response_required {
                    self.dispatch_response(Response::ok(command.command_id));
                }
                true
            }
            _ => false,
        }
    }

    /// Send `command`, waiting for a connection and resending across failures
    async fn send_command(&self, command: Command, deadline: Option<Instant>) -> TransportResult<()> {
        loop {
            {
                let state = self.lock();
                if state.closed {
                    drop(state);
                    return match command.body {
                        CommandBody::ShutdownInfo => {
                            if command.response_required {
                                self.dispatch_response(Response::ok(command.command_id));
                            }
                            Ok(())
                        }
                        _ => Err(TransportError::Closed),
                    };
                }
                if let Some(failure) = &state.failure {
                    return Err(failure.clone());
                }
            }

            if self.handle_while_disconnected(&command) {
                return Ok(());
            }

            let (transport, generation) = self.wait_for_transport(deadline).await?;
            let tracked = self.tracker.track(&command);
            if command.response_required {
                if let Some(pending) = self.requests().get_mut(&command.command_id) {
                    pending.sent_generation = Some(generation);
                    pending.tracked = tracked;
                }
            }

            match transport.oneway(command.clone()).await {
                Ok(()) => {
                    self.tracker.track_back(&command);
                    self.metrics.command_sent();
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        "Send of {} failed on generation {}: {}",
                        command.kind(),
                        generation,
                        e
                    );
                    self.handle_transport_failure(generation, e);

                    if tracked {
                        // Restore replays it on the next transport
                        return Ok(());
                    }
                    if command.response_required {
                        let mut requests = self.requests();
                        match requests.get_mut(&command.command_id) {
                            Some(pending) if pending.sent_generation == Some(generation) => {
                                pending.sent_generation = None;
                            }
                            // Already resent after a reconnect, or answered
                            _ => return Ok(()),
                        }
                    }
                }
            }
        }
    }

    fn register_request(
        &self,
        command: &Command,
        callback: Option<Arc<dyn ResponseCallback>>,
    ) -> FutureResponse {
        let (responder, future) = FutureResponse::channel();
        self.requests().insert(
            command.command_id,
            PendingRequest {
                command: command.clone(),
                sent_generation: None,
                tracked: false,
                responder: Some(responder),
                callback,
            },
        );
        future
    }

    fn forget_request(&self, command_id: i32) {
        self.requests().remove(&command_id);
    }

    /// Route a response to whoever waits for it; true when someone did
    fn resolve_response(&self, response: &Response) -> bool {
        let waiter = self.restore_waiters().remove(&response.correlation_id);
        let restore_consumed = waiter
            .map(|waiter| waiter.send(response.clone()).is_ok())
            .unwrap_or(false);

        let pending = self.requests().remove(&response.correlation_id);
        let request_consumed = match pending {
            Some(pending) => {
                pending.complete(response.clone());
                true
            }
            None => false,
        };

        restore_consumed || request_consumed
    }

    fn dispatch_response(&self, response: Response) {
        self.tracker.on_response(response.correlation_id);
        if !self.resolve_response(&response) {
            self.listener().on_command(Command::response(response));
        }
    }

    /// Inbound command from a physical transport
    fn handle_inbound(&self, command: Command) {
        match &command.body {
            CommandBody::Response(response) => {
                self.tracker.on_response(response.correlation_id);
                if self.resolve_response(response) {
                    return;
                }
            }
            CommandBody::ConnectionControl(control) => self.handle_connection_control(control),
            _ => {}
        }
        self.listener().on_command(command);
    }

    /// The transport of `generation` failed
    fn handle_transport_failure(&self, generation: u64, error: TransportError) {
        let detached = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            match &state.active {
                Some(active) if active.generation == generation => {}
                None if state.generation == generation => {
                    // Still connecting or restoring; the attempt fails on activation
                    debug!("Transport of generation {} failed while connecting: {}", generation, error);
                    state.failed_generation = Some(generation);
                    return;
                }
                _ => return,
            }
            state.retry_at = None;
            state.pending_interrupt = self.tracker.connection_ids().into_iter().collect();
            state.active.take()
        };

        let Some(detached) = detached else {
            return;
        };
        warn!(
            "Transport to {} failed: {}; reconnecting",
            detached.uri, error
        );
        self.interrupt(detached);
    }

    /// Drop the active transport deliberately, returning it
    fn detach_active(&self, reason: &str) -> Option<ActiveTransport> {
        let detached = {
            let mut state = self.lock();
            if state.active.is_some() {
                state.pending_interrupt = self.tracker.connection_ids().into_iter().collect();
            }
            state.active.take()
        }?;
        info!("Leaving {}: {}", detached.uri, reason);
        Some(detached)
    }

    fn interrupt(&self, detached: ActiveTransport) {
        self.uris.return_uri(&detached.uri);
        self.close_task.add(detached.transport);
        self.interrupted();
        self.runner.wakeup();
    }

    fn interrupted(&self) {
        self.connected_to_priority.store(false, Ordering::SeqCst);
        self.metrics.connection_interrupted();
        self.set_state(FailoverState::Interrupted);
        self.tracker.transport_interrupted();
        self.listener().transport_interrupted();
    }

    fn reconnect_pending(&self) -> bool {
        let promotion_possible = {
            let state = self.lock();
            if !state.started || state.closed || state.failure.is_some() {
                return false;
            }
            if state.active.is_none() {
                return state.retry_at.map(|at| Instant::now() >= at).unwrap_or(true);
            }
            if state.request.is_some() {
                return true;
            }
            self.config.priority_backup
        };

        promotion_possible
            && !self.connected_to_priority.load(Ordering::SeqCst)
            && self.backups.is_priority_backup_available()
    }

    fn plan_reconnect(&self) -> Option<ReconnectPlan> {
        let mut state = self.lock();
        if !state.started || state.closed || state.failure.is_some() {
            return None;
        }

        match (state.active.is_some(), state.request.take()) {
            (false, Some(ReconnectRequest::Target(uri))) => {
                Some(ReconnectPlan::Connect { target: Some(uri) })
            }
            (false, _) => Some(ReconnectPlan::Connect { target: None }),
            (true, Some(ReconnectRequest::Rebalance)) => Some(ReconnectPlan::Switch { target: None }),
            (true, Some(ReconnectRequest::Target(uri))) => {
                Some(ReconnectPlan::Switch { target: Some(uri) })
            }
            (true, None) => {
                drop(state);
                let promote = self.config.priority_backup
                    && !self.connected_to_priority.load(Ordering::SeqCst)
                    && self.backups.is_priority_backup_available();
                promote.then_some(ReconnectPlan::PromotePriority)
            }
        }
    }

    fn select_candidate(&self, target: Option<&str>) -> Option<Candidate> {
        if let Some(target) = target {
            if let Some(backup) = self.backups.take_backup_for(target) {
                return Some(Candidate::Backup(backup));
            }
            if self.uris.checkout(target) {
                return Some(Candidate::Uri(target.to_string()));
            }
            debug!("Requested URI {} is not available, using the pool", target);
        }

        if self.config.priority_backup {
            if let Some(backup) = self.backups.take_priority_backup() {
                return Some(Candidate::Backup(backup));
            }
        }

        if let Some(backup) = self.backups.get_backup() {
            return Some(Candidate::Backup(backup));
        }

        // Priority URIs go first once per cycle; after a failure the rotation decides
        if self.config.priority_backup && self.lock().connect_failures == 0 {
            if let Some(uri) = self.uris.get_priority_uri() {
                return Some(Candidate::Uri(uri));
            }
        }

        self.uris.get_uri().map(Candidate::Uri)
    }

    /// One step of the reconnect task
    async fn reconnect_iterate(&self) -> bool {
        let Some(plan) = self.plan_reconnect() else {
            return false;
        };

        let (target, switching) = match plan {
            ReconnectPlan::Connect { target } => (target, None),
            ReconnectPlan::Switch { target } => {
                let reason = match &target {
                    Some(uri) => format!("switching to {uri}"),
                    None => "rebalancing".to_string(),
                };
                (target, self.detach_active(&reason))
            }
            ReconnectPlan::PromotePriority => {
                let Some(backup) = self.backups.take_priority_backup() else {
                    return false;
                };
                let switching = self.detach_active("priority broker available");
                return self
                    .attempt(Candidate::Backup(backup), switching)
                    .await;
            }
        };

        let mut candidate = self.select_candidate(target.as_deref());
        if candidate.is_none() {
            if let Some(previous) = &switching {
                // Nothing else to move to; allow the broker just left
                self.uris.return_uri(&previous.uri);
                candidate = self.select_candidate(None);
            }
        }

        match candidate {
            Some(candidate) => self.attempt(candidate, switching).await,
            None => {
                self.finish_switch(switching, None);
                self.attempt_failed(TransportError::io("no broker URI available"))
            }
        }
    }

    /// Complete the bookkeeping of a transport left deliberately
    fn finish_switch(&self, switching: Option<ActiveTransport>, next_uri: Option<&str>) {
        if let Some(previous) = switching {
            if next_uri != Some(previous.uri.as_str()) {
                self.uris.return_uri(&previous.uri);
            }
            self.close_task.add(previous.transport);
            self.interrupted();
        }
    }

    /// Connect to `candidate`, restore state and make it the active transport
    async fn attempt(&self, candidate: Candidate, switching: Option<ActiveTransport>) -> bool {
        // The broker being left goes back to rotation once a new one is chosen
        self.finish_switch(switching, Some(candidate.uri()));

        let (generation, attempt) = {
            let mut state = self.lock();
            state.generation += 1;
            state.failed_generation = None;
            (state.generation, state.connect_failures + 1)
        };
        self.set_state(FailoverState::Connecting);
        self.metrics.connection_attempt();

        let uri = candidate.uri().to_string();
        let from_backup = matches!(candidate, Candidate::Backup(_));
        let span = reconnect_span!(attempt = attempt, uri = %uri, backup = from_backup);

        let result = self
            .connect_and_restore(candidate, generation)
            .instrument(span)
            .await;

        match result {
            Ok(transport) => {
                if from_backup {
                    self.metrics.backup_promoted();
                }
                self.activate(transport, uri, generation)
            }
            Err(e) => {
                self.uris.return_uri(&uri);
                self.attempt_failed(e)
            }
        }
    }

    async fn connect_and_restore(
        &self,
        candidate: Candidate,
        generation: u64,
    ) -> TransportResult<Arc<dyn Transport>> {
        let listener = Arc::new(FailoverTransportListener {
            transport: self.this.clone(),
            generation,
        });

        let transport = match candidate {
            Candidate::Backup(backup) => {
                if !backup.transport.is_connected() {
                    self.close_task.add(backup.transport);
                    return Err(TransportError::connect_failed(
                        backup.uri,
                        "backup transport is no longer connected",
                    ));
                }
                backup.transport.set_transport_listener(listener);
                debug!("Promoting backup transport to {}", backup.uri);
                backup.transport
            }
            Candidate::Uri(uri) => {
                let transport = self.registry.create(&uri).await?;
                transport.set_transport_listener(listener);
                let timeout = self.config.connect_timeout();
                match tokio::time::timeout(timeout, transport.start()).await {
                    Ok(Ok(())) => transport,
                    Ok(Err(e)) => {
                        self.close_task.add(transport);
                        return Err(e);
                    }
                    Err(_) => {
                        self.close_task.add(transport);
                        return Err(TransportError::timeout(
                            format!("connect to {uri}"),
                            timeout.as_millis() as u64,
                        ));
                    }
                }
            }
        };

        match self.restore(&transport, generation).await {
            Ok(()) => Ok(transport),
            Err(e) => {
                self.metrics.restore_failed();
                self.close_task.add(transport);
                Err(e)
            }
        }
    }

    /// Replay tracked state and unanswered requests onto `transport`
    async fn restore(&self, transport: &Arc<dyn Transport>, generation: u64) -> TransportResult<()> {
        let channel = RestoreChannel {
            failover: self,
            transport: transport.clone(),
            timeout: self.config.connect_timeout(),
            sent: Mutex::new(HashSet::new()),
        };

        let report = self.tracker.restore(&channel).await?;
        for response in report.in_doubt {
            warn!(
                "Commit {} was in flight during failover; reporting rollback",
                response.correlation_id
            );
            self.dispatch_response(response);
        }

        let replayed = channel.sent_ids();
        let mut answered = Vec::new();
        let mut resend = Vec::new();
        {
            let mut requests = self.requests();
            for (id, pending) in requests.iter_mut() {
                match pending.sent_generation {
                    Some(sent) if sent < generation => {
                        if replayed.contains(id) {
                            pending.sent_generation = Some(generation);
                        } else if pending.tracked {
                            answered.push(*id);
                        } else {
                            pending.sent_generation = Some(generation);
                            resend.push(pending.command.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        for id in answered {
            self.dispatch_response(Response::ok(id));
        }
        for command in resend {
            debug!("Resending unanswered {} ({})", command.kind(), command.command_id);
            transport.oneway(command).await?;
        }

        self.metrics.commands_replayed(report.replayed as u64);
        Ok(())
    }

    fn activate(&self, transport: Arc<dyn Transport>, uri: String, generation: u64) -> bool {
        let alive = transport.is_connected();
        let resumed = {
            let mut state = self.lock();
            if state.closed || state.failure.is_some() {
                drop(state);
                self.close_task.add(transport);
                return false;
            }
            if !alive || state.failed_generation == Some(generation) {
                drop(state);
                self.close_task.add(transport);
                self.uris.return_uri(&uri);
                return self.attempt_failed(TransportError::connect_failed(
                    uri,
                    "transport failed before it was activated",
                ));
            }
            state.active = Some(ActiveTransport {
                transport,
                uri: uri.clone(),
                generation,
            });
            state.connect_failures = 0;
            state.retry_at = None;
            let reconnected = !state.first_connection;
            state.first_connection = false;
            reconnected
        };

        self.connected_to_priority
            .store(self.uris.is_priority(&uri), Ordering::SeqCst);
        self.metrics.connection_established(&uri);
        info!("Connected to {}", uri);
        self.set_state(FailoverState::Connected);

        if resumed {
            self.listener().transport_resumed();
        }

        // Backups fill once the primary is up
        self.runner.wakeup();
        self.reconnect_pending()
    }

    fn attempt_failed(&self, error: TransportError) -> bool {
        self.metrics.connection_failed();

        let decision = {
            let mut state = self.lock();
            state.connect_failures += 1;
            self.policy
                .decide(state.connect_failures, state.first_connection, state.closed)
        };

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                warn!(
                    "Connect attempt failed: {}; attempt {} in {}ms",
                    error, attempt, delay_ms
                );
                let delay = Duration::from_millis(delay_ms);
                self.lock().retry_at = Some(Instant::now() + delay);
                self.runner.waker().wakeup_after(delay);
                false
            }
            ReconnectionDecision::AbortClosed => false,
            ReconnectionDecision::AbortMaxAttemptsExceeded { attempts } => {
                let failure = TransportError::ReconnectExhausted {
                    attempts,
                    last_error: error.to_string(),
                };
                {
                    let mut state = self.lock();
                    if state.failure.is_some() {
                        return false;
                    }
                    state.failure = Some(failure.clone());
                }
                error!("Giving up after {} connect attempt(s): {}", attempts, error);
                self.set_state(FailoverState::Failed(failure.to_string()));
                self.fail_waiters(&failure);
                self.listener().on_exception(failure);
                false
            }
        }
    }

    fn fail_waiters(&self, error: &TransportError) {
        let pending: Vec<PendingRequest> = self.requests().drain().map(|(_, p)| p).collect();
        for request in pending {
            request.fail(error.clone());
        }
        self.restore_waiters().clear();
    }

    fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout
            .or_else(|| self.config.timeout())
            .map(|timeout| Instant::now() + timeout)
    }
}

#[async_trait]
impl Transport for FailoverTransport {
    async fn start(&self) -> TransportResult<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.started {
                return Ok(());
            }
            state.started = true;
        }

        if self.state() == FailoverState::Disconnected {
            self.set_state(FailoverState::Connecting);
        }
        self.runner.start();
        self.runner.wakeup();
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        self.lock().started = false;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let span = failover_span!(uris = self.uris.len());
        async {
            let active = {
                let mut state = self.lock();
                if state.closed {
                    return;
                }
                state.closed = true;
                state.started = false;
                state.retry_at = None;
                state.request = None;
                state.active.take()
            };

            self.set_state(FailoverState::Closed);
            self.fail_waiters(&TransportError::Closed);
            self.backups.close();
            if let Some(active) = active {
                if let Err(e) = active.transport.close().await {
                    debug!("Error closing {}: {}", active.uri, e);
                }
            }
            self.close_task.close_all().await;
            self.runner.shutdown(RUNNER_SHUTDOWN_TIMEOUT).await;
            self.close_task.close_all().await;
            self.metrics.connection_closed();
        }
        .instrument(span)
        .await;
        Ok(())
    }

    async fn oneway(&self, command: Command) -> TransportResult<()> {
        let command = self.assign_id(command);
        let deadline = self.deadline(None);
        self.send_command(command, deadline).await
    }

    async fn request(&self, command: Command, timeout: Option<Duration>) -> TransportResult<Response> {
        let command = self.assign_id(command).with_response_required();
        let deadline = self.deadline(timeout);
        let id = command.command_id;

        let future = self.register_request(&command, None);
        if let Err(e) = self.send_command(command, deadline).await {
            self.forget_request(id);
            return Err(e);
        }

        match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, future.get()).await {
                Ok(result) => result,
                Err(_) => {
                    self.forget_request(id);
                    Err(TransportError::timeout(
                        "response",
                        timeout
                            .or_else(|| self.config.timeout())
                            .map(|t| t.as_millis() as u64)
                            .unwrap_or_default(),
                    ))
                }
            },
            None => future.get().await,
        }
    }

    async fn async_request(
        &self,
        command: Command,
        callback: Option<Arc<dyn ResponseCallback>>,
    ) -> TransportResult<FutureResponse> {
        let command = self.assign_id(command).with_response_required();
        let id = command.command_id;

        let future = self.register_request(&command, callback);
        if let Err(e) = self.send_command(command, self.deadline(None)).await {
            self.forget_request(id);
            return Err(e);
        }
        Ok(future)
    }

    async fn reconnect(&self, uri: &str) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.reconnect_to(uri);
        Ok(())
    }

    async fn update_uris(&self, rebalance: bool, uris: &[String]) -> TransportResult<()> {
        self.apply_updated_uris(rebalance, uris);
        Ok(())
    }

    fn set_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    fn is_connected(&self) -> bool {
        self.state_tx.borrow().can_send()
    }

    fn is_closed(&self) -> bool {
        *self.state_tx.borrow() == FailoverState::Closed
    }

    fn is_fault_tolerant(&self) -> bool {
        true
    }

    fn is_reconnect_supported(&self) -> bool {
        self.config.reconnect_supported
    }

    fn is_update_uris_supported(&self) -> bool {
        self.config.update_uris_supported
    }

    fn remote_address(&self) -> Option<String> {
        self.active_transport()
            .and_then(|(transport, _)| transport.remote_address())
    }

    fn inner_transport(&self) -> Option<Arc<dyn Transport>> {
        self.active_transport().map(|(transport, _)| transport)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl BackupEvents for FailoverTransport {
    fn is_primary_connected(&self) -> bool {
        self.state_tx.borrow().can_send()
    }

    fn is_connected_to_priority(&self) -> bool {
        self.connected_to_priority.load(Ordering::SeqCst)
    }

    fn on_priority_backup_available(&self) {
        if self.config.priority_backup && !self.connected_to_priority.load(Ordering::SeqCst) {
            info!("Priority backup ready, moving to priority broker");
            self.runner.wakeup();
        }
    }
}

/// Drives reconnects on the failover transport's runner
struct ReconnectTask {
    transport: Weak<FailoverTransport>,
}

#[async_trait]
impl CompositeTask for ReconnectTask {
    fn is_pending(&self) -> bool {
        self.transport
            .upgrade()
            .map(|transport| transport.reconnect_pending())
            .unwrap_or(false)
    }

    async fn iterate(&self) -> bool {
        match self.transport.upgrade() {
            Some(transport) => transport.reconnect_iterate().await,
            None => false,
        }
    }
}

/// Listener installed on each physical transport
struct FailoverTransportListener {
    transport: Weak<FailoverTransport>,
    generation: u64,
}

impl TransportListener for FailoverTransportListener {
    fn on_command(&self, command: Command) {
        if let Some(transport) = self.transport.upgrade() {
            transport.handle_inbound(command);
        }
    }

    fn on_exception(&self, error: TransportError) {
        if let Some(transport) = self.transport.upgrade() {
            transport.handle_transport_failure(self.generation, error);
        }
    }
}

/// Sends restored commands, waiting for acknowledgement where one is due
struct RestoreChannel<'a> {
    failover: &'a FailoverTransport,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    sent: Mutex<HashSet<i32>>,
}

impl RestoreChannel<'_> {
    fn sent_ids(&self) -> HashSet<i32> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl<'a> ReplayTarget for RestoreChannel<'a> {
    async fn replay(&self, command: Command) -> TransportResult<()> {
        let id = command.command_id;
        let kind = command.kind();
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);

        if !command.response_required || id == 0 {
            return self
                .transport
                .oneway(command)
                .await
                .map_err(|e| TransportError::restore_failed(format!("sending {kind}: {e}")));
        }

        let (tx, rx) = oneshot::channel();
        self.failover.restore_waiters().insert(id, tx);

        if let Err(e) = self.transport.oneway(command).await {
            self.failover.restore_waiters().remove(&id);
            return Err(TransportError::restore_failed(format!("sending {kind}: {e}")));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => match response.exception {
                Some(exception) => Err(TransportError::restore_failed(format!(
                    "broker rejected {kind}: {exception}"
                ))),
                None => Ok(()),
            },
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.failover.restore_waiters().remove(&id);
                Err(TransportError::timeout(
                    format!("restore of {kind}"),
                    self.timeout.as_millis() as u64,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNetwork;

    fn failover(uri: &str) -> Arc<FailoverTransport> {
        let registry = TransportRegistry::with_mock_network(MockNetwork::new());
        FailoverTransport::from_uri(uri, registry).unwrap()
    }

    fn candidate_uri(candidate: Option<Candidate>) -> Option<(bool, String)> {
        candidate.map(|candidate| {
            let from_backup = matches!(candidate, Candidate::Backup(_));
            (from_backup, candidate.uri().to_string())
        })
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_no_plan_until_started() {
        // Arrange
        let transport = failover("failover:(mock://a:1)");

        // Act
        let before = transport.plan_reconnect();
        transport.lock().started = true;
        let after = transport.plan_reconnect();

        // Assert
        assert!(before.is_none());
        assert!(matches!(after, Some(ReconnectPlan::Connect { target: None })));
    }

    #[tokio::test]
    async fn test_plan_follows_requested_target() {
        let transport = failover("failover:(mock://a:1)?randomize=false");
        transport.lock().started = true;

        transport.reconnect_to("mock://c:3");
        let plan = transport.plan_reconnect();

        assert!(matches!(
            plan,
            Some(ReconnectPlan::Connect { target: Some(ref uri) }) if uri == "mock://c:3"
        ));
        assert!(transport.uri_pool().contains("mock://c:3"));
        // The request is consumed
        assert!(matches!(
            transport.plan_reconnect(),
            Some(ReconnectPlan::Connect { target: None })
        ));
    }

    #[tokio::test]
    async fn test_closed_transport_plans_nothing() {
        let transport = failover("failover:(mock://a:1)");
        transport.start().await.unwrap();

        transport.close().await.unwrap();

        assert!(transport.plan_reconnect().is_none());
        assert!(!transport.reconnect_pending());
    }

    #[tokio::test]
    async fn test_target_uri_before_rotation() {
        // Arrange
        let transport = failover("failover:(mock://a:1,mock://b:2,mock://c:3)?randomize=false");

        // Act
        let targeted = transport.select_candidate(Some("mock://c:3"));
        let next = transport.select_candidate(None);
        let unknown = transport.select_candidate(Some("mock://z:9"));

        // Assert
        assert_eq!(candidate_uri(targeted), Some((false, "mock://c:3".to_string())));
        assert_eq!(candidate_uri(next), Some((false, "mock://a:1".to_string())));
        assert_eq!(candidate_uri(unknown), Some((false, "mock://b:2".to_string())));
        assert!(transport.select_candidate(None).is_none());
    }

    #[tokio::test]
    async fn test_priority_uri_only_leads_a_fresh_cycle() {
        // Arrange: the first URI is the implicit priority broker
        let transport = failover("failover:(mock://a:1,mock://b:2)?randomize=false&priorityBackup=true");

        // Act
        let first = transport.select_candidate(None);
        transport.uris.return_uri("mock://a:1");
        transport.lock().connect_failures = 1;
        let after_failure = transport.select_candidate(None);
        transport.uris.return_uri("mock://b:2");
        transport.lock().connect_failures = 0;
        let fresh_cycle = transport.select_candidate(None);

        // Assert
        assert_eq!(candidate_uri(first), Some((false, "mock://a:1".to_string())));
        assert_eq!(candidate_uri(after_failure), Some((false, "mock://b:2".to_string())));
        assert_eq!(candidate_uri(fresh_cycle), Some((false, "mock://a:1".to_string())));
    }

    #[tokio::test]
    async fn test_ready_backups_before_fresh_uris() {
        // Arrange
        let transport = failover(
            "failover:(mock://a:1,mock://b:2,mock://c:3,mock://d:4)?randomize=false&backup=true&backupPoolSize=2",
        );
        transport.start().await.unwrap();
        assert!(wait_until(|| transport.backup_count() == 2).await);

        // Act
        let targeted = transport.select_candidate(Some("mock://c:3"));
        let any = transport.select_candidate(None);

        // Assert
        let targeted_uri = candidate_uri(targeted);
        let any_uri = candidate_uri(any);
        assert_eq!(targeted_uri, Some((true, "mock://c:3".to_string())));
        assert_eq!(any_uri, Some((true, "mock://b:2".to_string())));

        transport.close().await.unwrap();
    }
}
