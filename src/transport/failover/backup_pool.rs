//! Pre-connected standby transports
//!
//! The pool runs as a [`CompositeTask`] on the failover transport's runner.
//! Each `iterate()` connects at most one new backup, to a URI checked out of
//! the shared [`UriPool`], so the runner is never held for more than one
//! bounded connect.

use super::close_task::CloseTransportsTask;
use super::uri_pool::UriPool;
use crate::backup_span;
use crate::config::FailoverConfig;
use crate::error::{TransportError, TransportResult};
use crate::protocol::Command;
use crate::task::{CompositeTask, TaskWaker};
use crate::transport::{Transport, TransportListener, TransportRegistry};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Backoff floor between failed backup connects
const MIN_BACKUP_RETRY_MS: u64 = 100;

/// A connected transport held in reserve
#[derive(Clone)]
pub struct BackupTransport {
    pub transport: Arc<dyn Transport>,
    pub uri: String,
    /// Connected to a priority URI
    pub priority: bool,
}

impl std::fmt::Debug for BackupTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupTransport")
            .field("uri", &self.uri)
            .field("priority", &self.priority)
            .finish()
    }
}

/// What the pool needs to know about its owning failover transport
pub trait BackupEvents: Send + Sync {
    /// Backups are only built while the primary connection is up
    fn is_primary_connected(&self) -> bool;

    fn is_connected_to_priority(&self) -> bool;

    /// A backup to a priority URI became ready
    fn on_priority_backup_available(&self);
}

/// Pool sizing and timing
#[derive(Debug, Clone)]
pub struct BackupPoolConfig {
    pub enabled: bool,
    pub size: usize,
    pub priority_backup: bool,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
}

impl From<&FailoverConfig> for BackupPoolConfig {
    fn from(config: &FailoverConfig) -> Self {
        Self {
            enabled: config.backups_enabled(),
            size: config.backup_pool_size,
            priority_backup: config.priority_backup,
            connect_timeout: config.connect_timeout(),
            retry_delay: Duration::from_millis(
                config.initial_reconnect_delay_ms.max(MIN_BACKUP_RETRY_MS),
            ),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    enabled: bool,
    closed: bool,
    backups: VecDeque<BackupTransport>,
    /// No new connect before this instant
    retry_at: Option<Instant>,
}

/// Pool of pre-connected backup transports
pub struct BackupTransportPool {
    this: Weak<BackupTransportPool>,
    config: BackupPoolConfig,
    uris: Arc<UriPool>,
    registry: Arc<TransportRegistry>,
    waker: TaskWaker,
    close_task: Arc<CloseTransportsTask>,
    events: Weak<dyn BackupEvents>,
    state: Mutex<PoolState>,
}

impl BackupTransportPool {
    pub fn new(
        config: BackupPoolConfig,
        uris: Arc<UriPool>,
        registry: Arc<TransportRegistry>,
        waker: TaskWaker,
        close_task: Arc<CloseTransportsTask>,
        events: Weak<dyn BackupEvents>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(PoolState {
                enabled: config.enabled,
                ..PoolState::default()
            }),
            config,
            uris,
            registry,
            waker,
            close_task,
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Enable or disable the pool; disabling releases every backup
    pub fn set_enabled(&self, enabled: bool) {
        let released = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.enabled = enabled;
            if enabled {
                Vec::new()
            } else {
                state.backups.drain(..).collect()
            }
        };

        for backup in released {
            self.release(backup);
        }
        if enabled {
            self.waker.wakeup();
        }
    }

    pub fn backup_count(&self) -> usize {
        self.lock().backups.len()
    }

    pub fn backup_uris(&self) -> Vec<String> {
        self.lock().backups.iter().map(|b| b.uri.clone()).collect()
    }

    pub fn is_priority_backup_available(&self) -> bool {
        self.lock().backups.iter().any(|backup| backup.priority)
    }

    /// Take any ready backup; the pool refills in the background
    pub fn get_backup(&self) -> Option<BackupTransport> {
        let backup = self.lock().backups.pop_front();
        if backup.is_some() {
            self.waker.wakeup();
        }
        backup
    }

    /// Take a ready backup connected to a priority URI
    pub fn take_priority_backup(&self) -> Option<BackupTransport> {
        self.take_where(|backup| backup.priority)
    }

    /// Take the ready backup connected to `uri`
    pub fn take_backup_for(&self, uri: &str) -> Option<BackupTransport> {
        self.take_where(|backup| backup.uri == uri)
    }

    fn take_where<F: Fn(&BackupTransport) -> bool>(&self, predicate: F) -> Option<BackupTransport> {
        let backup = {
            let mut state = self.lock();
            let position = state.backups.iter().position(predicate)?;
            state.backups.remove(position)
        };
        self.waker.wakeup();
        backup
    }

    /// A backup transport failed while waiting in the pool
    pub fn on_backup_transport_failure(&self, uri: &str) {
        let failed = {
            let mut state = self.lock();
            let position = state.backups.iter().position(|backup| backup.uri == uri);
            position.and_then(|position| state.backups.remove(position))
        };

        if let Some(backup) = failed {
            warn!("Backup transport to {} failed", backup.uri);
            self.release(backup);
            self.waker.wakeup();
        }
    }

    /// Close every backup and stop filling
    pub fn close(&self) {
        let released: Vec<BackupTransport> = {
            let mut state = self.lock();
            state.closed = true;
            state.enabled = false;
            state.backups.drain(..).collect()
        };
        for backup in released {
            self.close_task.add(backup.transport);
        }
    }

    /// Return a backup's URI to rotation and queue the transport for closing
    fn release(&self, backup: BackupTransport) {
        self.uris.return_uri(&backup.uri);
        self.close_task.add(backup.transport);
    }

    fn events(&self) -> Option<Arc<dyn BackupEvents>> {
        self.events.upgrade()
    }

    /// Which kind of backup the pool should build next, if any
    fn wanted(&self) -> Option<bool> {
        let (enabled, count, has_priority, retry_at) = {
            let state = self.lock();
            (
                state.enabled && !state.closed,
                state.backups.len(),
                state.backups.iter().any(|backup| backup.priority),
                state.retry_at,
            )
        };

        if !enabled || retry_at.map(|at| Instant::now() < at).unwrap_or(false) {
            return None;
        }

        let events = self.events()?;
        if !events.is_primary_connected() {
            return None;
        }

        if self.config.priority_backup
            && !has_priority
            && !events.is_connected_to_priority()
            && self.uris.is_priority_available()
        {
            return Some(true);
        }

        if count < self.config.size && self.uris.available_count() > 0 {
            return Some(false);
        }

        None
    }

    async fn connect_backup(&self, uri: &str) -> TransportResult<Arc<dyn Transport>> {
        let transport = self.registry.create(uri).await?;
        transport.set_transport_listener(Arc::new(BackupTransportListener {
            pool: self.this.clone(),
            uri: uri.to_string(),
        }));

        match tokio::time::timeout(self.config.connect_timeout, transport.start()).await {
            Ok(Ok(())) => Ok(transport),
            Ok(Err(e)) => {
                self.close_task.add(transport);
                Err(e)
            }
            Err(_) => {
                self.close_task.add(transport);
                Err(TransportError::timeout(
                    format!("backup connect to {uri}"),
                    self.config.connect_timeout.as_millis() as u64,
                ))
            }
        }
    }
}

#[async_trait]
impl CompositeTask for BackupTransportPool {
    fn is_pending(&self) -> bool {
        self.wanted().is_some()
    }

    async fn iterate(&self) -> bool {
        let Some(priority) = self.wanted() else {
            return false;
        };

        let uri = if priority {
            self.uris.get_priority_uri()
        } else {
            self.uris.get_uri()
        };
        let Some(uri) = uri else {
            return false;
        };

        let span = backup_span!(uri = %uri, priority = priority);
        let result = self.connect_backup(&uri).instrument(span).await;

        match result {
            Ok(transport) => {
                let priority = self.uris.is_priority(&uri);
                let backup = BackupTransport {
                    transport,
                    uri: uri.clone(),
                    priority,
                };

                let discarded = {
                    let mut state = self.lock();
                    state.retry_at = None;
                    if state.closed || !state.enabled {
                        Some(backup)
                    } else {
                        if priority {
                            state.backups.push_front(backup);
                        } else {
                            state.backups.push_back(backup);
                        }
                        None
                    }
                };

                if let Some(backup) = discarded {
                    self.release(backup);
                    return false;
                }

                info!("Backup transport connected to {}", uri);
                if priority {
                    if let Some(events) = self.events() {
                        events.on_priority_backup_available();
                    }
                }
                self.wanted().is_some()
            }
            Err(e) => {
                debug!("Backup connect to {} failed: {}", uri, e);
                self.uris.return_uri(&uri);
                self.lock().retry_at = Some(Instant::now() + self.config.retry_delay);
                self.waker.wakeup_after(self.config.retry_delay);
                false
            }
        }
    }
}

/// Removes a backup from the pool when its transport fails
struct BackupTransportListener {
    pool: Weak<BackupTransportPool>,
    uri: String,
}

impl TransportListener for BackupTransportListener {
    fn on_command(&self, command: Command) {
        debug!("Ignoring {} received on backup {}", command.kind(), self.uri);
    }

    fn on_exception(&self, _error: TransportError) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_backup_transport_failure(&self.uri);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CompositeTaskRunner;
    use crate::testing::{MockNetwork, MockTransport};
    use crate::transport::narrow;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Primary {
        connected: AtomicBool,
        on_priority: AtomicBool,
        priority_ready: AtomicUsize,
    }

    impl BackupEvents for Primary {
        fn is_primary_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn is_connected_to_priority(&self) -> bool {
            self.on_priority.load(Ordering::SeqCst)
        }

        fn on_priority_backup_available(&self) {
            self.priority_ready.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        runner: CompositeTaskRunner,
        network: Arc<MockNetwork>,
        uris: Arc<UriPool>,
        pool: Arc<BackupTransportPool>,
        primary: Arc<Primary>,
    }

    fn fixture(uris: &[&str], size: usize, priority_backup: bool) -> Fixture {
        let runner = CompositeTaskRunner::new("backup-test");
        let network = MockNetwork::new();
        let registry = TransportRegistry::with_mock_network(network.clone());
        let uris = Arc::new(UriPool::new(
            uris.iter().map(|uri| uri.to_string()),
            Vec::new(),
            false,
        ));
        let close_task = Arc::new(CloseTransportsTask::new(runner.waker()));
        let primary = Arc::new(Primary::default());
        primary.connected.store(true, Ordering::SeqCst);
        let events: Weak<dyn BackupEvents> = Arc::downgrade(&primary) as Weak<dyn BackupEvents>;

        let pool = BackupTransportPool::new(
            BackupPoolConfig {
                enabled: true,
                size,
                priority_backup,
                connect_timeout: Duration::from_secs(1),
                retry_delay: Duration::from_millis(20),
            },
            uris.clone(),
            registry,
            runner.waker(),
            close_task.clone(),
            events,
        );
        runner.add_task(pool.clone());
        runner.add_task(close_task);

        Fixture {
            runner,
            network,
            uris,
            pool,
            primary,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_pool_fills_to_size() {
        // Arrange: primary holds a:1, pool may use the rest
        let f = fixture(&["mock://a:1", "mock://b:2", "mock://c:3"], 2, false);
        assert!(f.uris.checkout("mock://a:1"));

        // Act
        f.runner.start();

        // Assert
        assert!(wait_until(|| f.pool.backup_count() == 2).await);
        assert_eq!(f.pool.backup_uris(), vec!["mock://b:2", "mock://c:3"]);
        assert_eq!(f.uris.available_count(), 0);
        assert!(!f.pool.is_pending());

        f.runner.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_pool_waits_for_primary() {
        let f = fixture(&["mock://a:1", "mock://b:2"], 1, false);
        f.primary.connected.store(false, Ordering::SeqCst);

        f.runner.start();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(f.pool.backup_count(), 0);
        f.runner.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_get_backup_hands_over_connected_transport() {
        let f = fixture(&["mock://a:1", "mock://b:2"], 1, false);
        f.uris.checkout("mock://a:1");
        f.runner.start();
        assert!(wait_until(|| f.pool.backup_count() == 1).await);

        let backup = f.pool.get_backup().unwrap();

        assert_eq!(backup.uri, "mock://b:2");
        assert!(backup.transport.is_connected());
        assert!(narrow::<MockTransport>(&backup.transport).is_some());
        assert_eq!(f.pool.backup_count(), 0);
        f.runner.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failed_backup_is_removed_and_uri_returned() {
        let f = fixture(&["mock://a:1", "mock://b:2"], 1, false);
        f.uris.checkout("mock://a:1");
        f.runner.start();
        assert!(wait_until(|| f.pool.backup_count() == 1).await);

        // Act: the backup's broker goes away
        f.network.broker("b:2").stop();

        // Assert: removed; reconnect attempts are refused while b:2 is down
        assert!(wait_until(|| f.pool.backup_count() == 0).await);
        f.network.broker("b:2").start();
        assert!(wait_until(|| f.pool.backup_count() == 1).await);
        f.runner.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_priority_backup_is_built_and_announced() {
        // Arrange: connected to b:2, the implicit priority a:1 is down
        let f = fixture(&["mock://a:1", "mock://b:2"], 1, true);
        f.uris.checkout("mock://b:2");
        f.network.add_broker("a:1", false);
        f.runner.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!f.pool.is_priority_backup_available());

        // Act
        f.network.broker("a:1").start();

        // Assert
        assert!(wait_until(|| f.pool.is_priority_backup_available()).await);
        assert_eq!(f.primary.priority_ready.load(Ordering::SeqCst), 1);
        let backup = f.pool.take_priority_backup().unwrap();
        assert_eq!(backup.uri, "mock://a:1");
        f.runner.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_disable_releases_backups() {
        let f = fixture(&["mock://a:1", "mock://b:2"], 1, false);
        f.uris.checkout("mock://a:1");
        f.runner.start();
        assert!(wait_until(|| f.pool.backup_count() == 1).await);

        f.pool.set_enabled(false);

        assert_eq!(f.pool.backup_count(), 0);
        assert!(f.uris.is_available("mock://b:2"));
        assert!(wait_until(|| f.network.broker("b:2").connection_count() == 0).await);
        f.runner.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_close_stops_filling() {
        let f = fixture(&["mock://a:1", "mock://b:2"], 1, false);
        f.uris.checkout("mock://a:1");

        f.pool.close();
        f.runner.start();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(f.pool.backup_count(), 0);
        assert!(!f.pool.is_enabled());
        f.runner.shutdown(Duration::from_secs(1)).await;
    }
}
