//! Single-worker runner for composite tasks
//!
//! The runner owns one spawned tokio task. Whenever it is woken it scans the
//! registered tasks, calls `iterate()` on every pending one and keeps looping
//! until none has work left, then parks until the next wakeup or shutdown.

use super::CompositeTask;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type TaskList = Arc<Mutex<Vec<Arc<dyn CompositeTask>>>>;

/// Cloneable handle that wakes a runner without blocking
#[derive(Clone, Debug)]
pub struct TaskWaker {
    notify: Arc<Notify>,
}

impl TaskWaker {
    /// Signal the runner that some task may have become pending
    pub fn wakeup(&self) {
        self.notify.notify_one();
    }

    /// Wake the runner once `delay` has elapsed
    pub fn wakeup_after(&self, delay: Duration) {
        if delay.is_zero() {
            self.wakeup();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let notify = self.notify.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    notify.notify_one();
                });
            }
            Err(_) => self.wakeup(),
        }
    }
}

/// Drives registered [`CompositeTask`]s on one dedicated worker
pub struct CompositeTaskRunner {
    name: String,
    tasks: TaskList,
    notify: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CompositeTaskRunner {
    pub fn new<S: Into<String>>(name: S) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            notify: Arc::new(Notify::new()),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn waker(&self) -> TaskWaker {
        TaskWaker {
            notify: self.notify.clone(),
        }
    }

    /// Register a task; it is considered on the next scan
    pub fn add_task(&self, task: Arc<dyn CompositeTask>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
        self.wakeup();
    }

    /// Deregister a task
    pub fn remove_task(&self, task: &Arc<dyn CompositeTask>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|registered| !Arc::ptr_eq(registered, task));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Spawn the worker; calling start on a running runner does nothing
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() || *self.shutdown_tx.borrow() {
            return;
        }

        let name = self.name.clone();
        let tasks = self.tasks.clone();
        let notify = self.notify.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            Self::run(name, tasks, notify, shutdown_rx).await;
        }));
    }

    pub fn is_started(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Wake the worker; never blocks
    pub fn wakeup(&self) {
        self.notify.notify_one();
    }

    /// Stop the worker and wait for it to finish; pending work is abandoned
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown_tx.send_replace(true);
        self.notify.notify_one();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => debug!("Task runner {} shut down gracefully", self.name),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Task runner {} ended with error: {}", self.name, e);
                }
                Err(_) => {
                    warn!(
                        "Task runner {} didn't shut down gracefully, forcing abort",
                        self.name
                    );
                    abort.abort();
                }
                _ => {}
            }
        }
    }

    async fn run(
        name: String,
        tasks: TaskList,
        notify: Arc<Notify>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Task runner {} started", name);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            Self::drain(&tasks, &shutdown_rx).await;

            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = notify.notified() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Task runner {} stopped", name);
    }

    /// Iterate pending tasks until none reports more work
    async fn drain(tasks: &TaskList, shutdown_rx: &watch::Receiver<bool>) {
        loop {
            let snapshot: Vec<Arc<dyn CompositeTask>> =
                tasks.lock().unwrap_or_else(|e| e.into_inner()).clone();

            let mut more_work = false;
            for task in &snapshot {
                if *shutdown_rx.borrow() {
                    return;
                }
                if task.is_pending() && task.iterate().await {
                    more_work = true;
                }
            }

            if !more_work && !snapshot.iter().any(|task| task.is_pending()) {
                return;
            }

            tokio::task::yield_now().await;
        }
    }
}

impl Drop for CompositeTaskRunner {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
