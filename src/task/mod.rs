//! Cooperative background tasks
//!
//! A [`CompositeTask`] is a unit of background work that a
//! [`CompositeTaskRunner`] drives on a single worker. All tasks registered with
//! one runner have their `iterate()` calls serialized, so an `iterate()` must
//! never wait indefinitely.

pub mod runner;

pub use runner::{CompositeTaskRunner, TaskWaker};

use async_trait::async_trait;

/// Background work driven by a [`CompositeTaskRunner`]
#[async_trait]
pub trait CompositeTask: Send + Sync {
    /// Whether the task has work to do right now
    fn is_pending(&self) -> bool;

    /// Perform one unit of work; returns true if more work remains
    async fn iterate(&self) -> bool;
}
