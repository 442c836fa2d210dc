//! Task dispatch.
//!
//! This module provides:
//!
//! - [`Dispatcher`]: the producer side, used by handlers and cron triggers
//! - [`TaskSource`]: the consumer side, used by the [`TaskWorker`]
//! - [`MemoryTaskQueue`]: in-process queue for tests and development
//! - [`crate::db::PgTaskQueue`]: durable Postgres queue
//!
//! ## Delivery
//!
//! Delivery is at-least-once. A leased task that is neither completed nor
//! rescheduled before its lease expires becomes deliverable again, so every
//! handler must tolerate redelivery.

mod memory;
mod worker;

pub use memory::MemoryTaskQueue;
pub use worker::{QueueLimit, TaskWorker, WorkerConfig, WorkerStats};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use vmfleet_tasks::{Queue, Task, TaskEnvelope, TaskError};

/// Dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The task failed validation and was not enqueued.
    #[error("invalid task: {0}")]
    InvalidTask(#[from] TaskError),

    /// No task with this id is leased.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The queue backend failed.
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl DispatchError {
    /// Whether retrying the same call cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DispatchError::InvalidTask(_))
    }
}

/// Task counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Waiting for delivery, including tasks waiting out a retry delay.
    pub pending: u64,
    /// Currently leased by a worker.
    pub leased: u64,
    /// Given up on.
    pub failed: u64,
}

/// Producer side of the task queue.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Validate and enqueue tasks, each on its own queue.
    ///
    /// Either every task is enqueued or none is.
    async fn add_tasks(&self, tasks: Vec<Task>) -> Result<(), DispatchError>;

    /// Per-queue counts, for every known queue.
    async fn queue_stats(&self) -> Result<Vec<(Queue, QueueStats)>, DispatchError>;

    /// Delete tasks that failed more than `older_than` ago. Returns how
    /// many were removed.
    async fn purge_failed(&self, older_than: Duration) -> Result<u64, DispatchError>;
}

/// Consumer side of the task queue.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Lease up to `limit` deliverable tasks from `queue` for `lease_for`.
    ///
    /// Each returned envelope has its attempt count incremented.
    async fn lease(
        &self,
        queue: Queue,
        limit: usize,
        lease_for: Duration,
    ) -> Result<Vec<TaskEnvelope>, DispatchError>;

    /// Remove a finished task.
    async fn complete(&self, task_id: &str) -> Result<(), DispatchError>;

    /// Make a task deliverable again after `delay`.
    async fn retry(&self, task_id: &str, delay: Duration, error: &str)
        -> Result<(), DispatchError>;

    /// Give up on a task.
    async fn fail(&self, task_id: &str, error: &str) -> Result<(), DispatchError>;
}

/// Validate a batch before any of it is enqueued.
pub(crate) fn validate_all(tasks: &[Task]) -> Result<(), DispatchError> {
    for task in tasks {
        task.validate()?;
    }
    Ok(())
}
