//! Queue worker.
//!
//! Leases tasks from every configured queue on a poll interval, runs their
//! handlers concurrently, and settles each delivery:
//!
//! - success: the task is completed
//! - permanent error, or attempts exhausted: the task is failed
//! - anything else: the task is retried after the policy's backoff

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use vmfleet_tasks::{Queue, RetryPolicy, TaskEnvelope};

use super::TaskSource;
use crate::handlers::Handlers;

/// Concurrency cap for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimit {
    pub queue: Queue,
    /// Most tasks leased from the queue per poll.
    pub max_concurrent: usize,
}

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queues: Vec<QueueLimit>,
    pub retry: RetryPolicy,
    /// How long a delivery may run before the task is redelivered.
    pub lease_for: Duration,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    /// Serve every queue with the same concurrency cap.
    pub fn all_queues(max_concurrent: usize) -> Self {
        Self {
            queues: Queue::ALL
                .into_iter()
                .map(|queue| QueueLimit {
                    queue,
                    max_concurrent,
                })
                .collect(),
            ..Self::default()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            retry: RetryPolicy::default(),
            lease_for: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Delivery outcomes of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

impl WorkerStats {
    pub fn total(&self) -> usize {
        self.completed + self.retried + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Completed,
    Retried,
    Failed,
}

impl Settled {
    fn as_str(self) -> &'static str {
        match self {
            Settled::Completed => "completed",
            Settled::Retried => "retried",
            Settled::Failed => "failed",
        }
    }
}

/// Runs handlers for leased tasks.
pub struct TaskWorker {
    source: Arc<dyn TaskSource>,
    handlers: Handlers,
    config: WorkerConfig,
}

impl TaskWorker {
    pub fn new(source: Arc<dyn TaskSource>, handlers: Handlers, config: WorkerConfig) -> Self {
        Self {
            source,
            handlers,
            config,
        }
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queues = self.config.queues.len(),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Starting task worker"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.run_once().await;
                    if stats.total() > 0 {
                        debug!(
                            completed = stats.completed,
                            retried = stats.retried,
                            failed = stats.failed,
                            "Task poll complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Task worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Lease from every queue once and settle everything leased.
    pub async fn run_once(&self) -> WorkerStats {
        let mut leased = Vec::new();
        for limit in &self.config.queues {
            match self
                .source
                .lease(limit.queue, limit.max_concurrent, self.config.lease_for)
                .await
            {
                Ok(envelopes) => leased.extend(envelopes),
                Err(e) => error!(queue = %limit.queue, error = %e, "Failed to lease tasks"),
            }
        }

        let mut stats = WorkerStats::default();
        for settled in join_all(leased.iter().map(|env| self.deliver(env))).await {
            match settled {
                Settled::Completed => stats.completed += 1,
                Settled::Retried => stats.retried += 1,
                Settled::Failed => stats.failed += 1,
            }
        }
        stats
    }

    async fn deliver(&self, env: &TaskEnvelope) -> Settled {
        let result = self.handlers.handle(&env.task).await;

        let (settled, ack) = match result {
            Ok(()) => (Settled::Completed, self.source.complete(&env.task_id).await),
            Err(e) if e.is_permanent() || self.config.retry.exhausted(env.attempt) => {
                warn!(
                    task_id = %env.task_id,
                    queue = %env.queue,
                    attempt = env.attempt,
                    permanent = e.is_permanent(),
                    error = %e,
                    "Task failed"
                );
                (
                    Settled::Failed,
                    self.source.fail(&env.task_id, &e.to_string()).await,
                )
            }
            Err(e) => {
                let delay = self.config.retry.backoff(env.attempt);
                debug!(
                    task_id = %env.task_id,
                    queue = %env.queue,
                    attempt = env.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying task"
                );
                (
                    Settled::Retried,
                    self.source.retry(&env.task_id, delay, &e.to_string()).await,
                )
            }
        };

        // The lease expires and the task is redelivered.
        if let Err(e) = ack {
            error!(task_id = %env.task_id, error = %e, "Failed to settle task");
        }
        self.handlers
            .deps()
            .metrics
            .record_task(env.queue.as_str(), settled.as_str());
        settled
    }
}
