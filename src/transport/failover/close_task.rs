//! Background disposal of failed and replaced transports

use crate::task::{CompositeTask, TaskWaker};
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Closes queued transports on the task runner, off the caller's path
pub struct CloseTransportsTask {
    queue: Mutex<VecDeque<Arc<dyn Transport>>>,
    waker: TaskWaker,
}

impl CloseTransportsTask {
    pub fn new(waker: TaskWaker) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<dyn Transport>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a transport for closing and wake the runner
    pub fn add(&self, transport: Arc<dyn Transport>) {
        self.lock().push_back(transport);
        self.waker.wakeup();
    }

    pub fn queued(&self) -> usize {
        self.lock().len()
    }

    /// Close everything still queued, in the calling task
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain(..).collect();
        for transport in drained {
            Self::close_quietly(transport).await;
        }
    }

    async fn close_quietly(transport: Arc<dyn Transport>) {
        if let Err(e) = transport.close().await {
            debug!("Ignoring error while closing transport: {}", e);
        }
    }
}

#[async_trait]
impl CompositeTask for CloseTransportsTask {
    fn is_pending(&self) -> bool {
        !self.lock().is_empty()
    }

    async fn iterate(&self) -> bool {
        let next = self.lock().pop_front();
        if let Some(transport) = next {
            Self::close_quietly(transport).await;
        }
        !self.lock().is_empty()
    }
}
