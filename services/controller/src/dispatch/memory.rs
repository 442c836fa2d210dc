//! In-memory task queue.
//!
//! Suitable for tests and single-process development only: nothing is
//! persisted. Lease and retry times follow the injected [`Clock`], so tests
//! can expire leases without sleeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use vmfleet_tasks::{Queue, Task, TaskEnvelope};

use super::{validate_all, DispatchError, Dispatcher, QueueStats, TaskSource};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
enum EntryState {
    Pending,
    Leased,
    Failed {
        error: String,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    envelope: TaskEnvelope,
    state: EntryState,
    visible_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl Entry {
    fn deliverable(&self, now: DateTime<Utc>) -> bool {
        !self.is_failed() && self.visible_at <= now
    }

    fn is_failed(&self) -> bool {
        matches!(self.state, EntryState::Failed { .. })
    }
}

/// In-process queue implementing both [`Dispatcher`] and [`TaskSource`].
pub struct MemoryTaskQueue {
    entries: Mutex<Vec<Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryTaskQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Tasks on `queue` that are not failed, in enqueue order.
    pub async fn tasks(&self, queue: Queue) -> Vec<Task> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.envelope.queue == queue && !e.is_failed())
            .map(|e| e.envelope.task.clone())
            .collect()
    }

    /// Number of tasks that are not failed, across all queues.
    pub async fn len(&self) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| !e.is_failed())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove and return every task that is not failed, in enqueue order.
    pub async fn take_all(&self) -> Vec<Task> {
        let mut entries = self.entries.lock().await;
        let (failed, live): (Vec<Entry>, Vec<Entry>) = entries
            .drain(..)
            .partition(Entry::is_failed);
        *entries = failed;
        live.into_iter().map(|e| e.envelope.task).collect()
    }

    /// Failed tasks with their final error.
    pub async fn failed(&self) -> Vec<(Task, String)> {
        self.entries
            .lock()
            .await
            .iter()
            .filter_map(|e| match &e.state {
                EntryState::Failed { error, .. } => Some((e.envelope.task.clone(), error.clone())),
                _ => None,
            })
            .collect()
    }

    /// The last recorded error of a task that is waiting to be retried.
    pub async fn last_error(&self, task_id: &str) -> Option<String> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.envelope.task_id == task_id)
            .and_then(|e| e.last_error.clone())
    }

    fn later(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(by)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl Dispatcher for MemoryTaskQueue {
    async fn add_tasks(&self, tasks: Vec<Task>) -> Result<(), DispatchError> {
        validate_all(&tasks)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.extend(tasks.into_iter().map(|task| Entry {
            envelope: TaskEnvelope::new(task, now),
            state: EntryState::Pending,
            visible_at: now,
            last_error: None,
        }));
        Ok(())
    }

    async fn queue_stats(&self) -> Result<Vec<(Queue, QueueStats)>, DispatchError> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(Queue::ALL
            .into_iter()
            .map(|queue| {
                let mut stats = QueueStats::default();
                for e in entries.iter().filter(|e| e.envelope.queue == queue) {
                    match e.state {
                        EntryState::Failed { .. } => stats.failed += 1,
                        EntryState::Leased if e.visible_at > now => stats.leased += 1,
                        _ => stats.pending += 1,
                    }
                }
                (queue, stats)
            })
            .collect())
    }

    async fn purge_failed(&self, older_than: Duration) -> Result<u64, DispatchError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| match e.state {
            EntryState::Failed { at, .. } => Self::later(at, older_than) > now,
            _ => true,
        });
        Ok((before - entries.len()) as u64)
    }
}

#[async_trait]
impl TaskSource for MemoryTaskQueue {
    async fn lease(
        &self,
        queue: Queue,
        limit: usize,
        lease_for: Duration,
    ) -> Result<Vec<TaskEnvelope>, DispatchError> {
        let now = self.clock.now();
        let until = Self::later(now, lease_for);
        let mut entries = self.entries.lock().await;

        let mut leased = Vec::new();
        for entry in entries
            .iter_mut()
            .filter(|e| e.envelope.queue == queue && e.deliverable(now))
            .take(limit)
        {
            entry.state = EntryState::Leased;
            entry.visible_at = until;
            entry.envelope.attempt += 1;
            leased.push(entry.envelope.clone());
        }
        Ok(leased)
    }

    async fn complete(&self, task_id: &str) -> Result<(), DispatchError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.envelope.task_id != task_id);
        if entries.len() == before {
            return Err(DispatchError::NotFound(task_id.to_string()));
        }
        Ok(())
    }

    async fn retry(
        &self,
        task_id: &str,
        delay: Duration,
        error: &str,
    ) -> Result<(), DispatchError> {
        let visible_at = Self::later(self.clock.now(), delay);
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.envelope.task_id == task_id)
            .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))?;
        entry.state = EntryState::Pending;
        entry.visible_at = visible_at;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn fail(&self, task_id: &str, error: &str) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.envelope.task_id == task_id)
            .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))?;
        entry.state = EntryState::Failed {
            error: error.to_string(),
            at: now,
        };
        entry.last_error = Some(error.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn queue() -> (Arc<ManualClock>, MemoryTaskQueue) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = MemoryTaskQueue::new(clock.clone());
        (clock, queue)
    }

    #[tokio::test]
    async fn test_add_tasks_rejects_invalid_batch() {
        let (_, q) = queue();
        let err = q
            .add_tasks(vec![Task::manage_bot("p-0"), Task::manage_bot("")])
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_lease_respects_queue_and_limit() {
        let (_, q) = queue();
        q.add_tasks(vec![
            Task::manage_bot("p-0"),
            Task::manage_bot("p-1"),
            Task::manage_bot("p-2"),
            Task::create_instance("p-3"),
        ])
        .await
        .unwrap();

        let leased = q
            .lease(Queue::ManageBot, 2, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(leased.len(), 2);
        assert!(leased.iter().all(|e| e.queue == Queue::ManageBot && e.attempt == 1));

        let rest = q
            .lease(Queue::ManageBot, 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].task, Task::manage_bot("p-2"));
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let (clock, q) = queue();
        q.add_tasks(vec![Task::manage_bot("p-0")]).await.unwrap();

        let first = q
            .lease(Queue::ManageBot, 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(q
            .lease(Queue::ManageBot, 1, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty());

        clock.advance(chrono::Duration::seconds(31));
        let again = q
            .lease(Queue::ManageBot, 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].task_id, first[0].task_id);
        assert_eq!(again[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_retry_delays_and_fail_parks() {
        let (clock, q) = queue();
        q.add_tasks(vec![Task::manage_bot("p-0"), Task::manage_bot("p-1")])
            .await
            .unwrap();
        let leased = q
            .lease(Queue::ManageBot, 2, Duration::from_secs(30))
            .await
            .unwrap();

        q.retry(&leased[0].task_id, Duration::from_secs(10), "boom")
            .await
            .unwrap();
        q.fail(&leased[1].task_id, "bad").await.unwrap();

        assert_eq!(q.last_error(&leased[0].task_id).await.as_deref(), Some("boom"));
        assert!(q
            .lease(Queue::ManageBot, 2, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty());

        clock.advance(chrono::Duration::seconds(10));
        let retried = q
            .lease(Queue::ManageBot, 2, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].task, Task::manage_bot("p-0"));

        let failed = q.failed().await;
        assert_eq!(failed, vec![(Task::manage_bot("p-1"), "bad".to_string())]);
    }

    #[tokio::test]
    async fn test_complete_and_stats() {
        let (_, q) = queue();
        q.add_tasks(vec![Task::manage_bot("p-0"), Task::manage_bot("p-1")])
            .await
            .unwrap();
        let leased = q
            .lease(Queue::ManageBot, 1, Duration::from_secs(30))
            .await
            .unwrap();

        let stats: std::collections::BTreeMap<_, _> =
            q.queue_stats().await.unwrap().into_iter().collect();
        assert_eq!(
            stats[&Queue::ManageBot],
            QueueStats {
                pending: 1,
                leased: 1,
                failed: 0
            }
        );
        assert_eq!(stats[&Queue::ExpandConfig], QueueStats::default());

        q.complete(&leased[0].task_id).await.unwrap();
        assert_eq!(q.len().await, 1);
        assert!(matches!(
            q.complete(&leased[0].task_id).await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_failed_keeps_recent_and_live_tasks() {
        let (clock, q) = queue();
        q.add_tasks(vec![
            Task::create_instance("p-0"),
            Task::create_instance("p-1"),
            Task::create_instance("p-2"),
        ])
        .await
        .unwrap();
        let leased = q
            .lease(Queue::CreateInstance, 2, Duration::from_secs(30))
            .await
            .unwrap();
        q.fail(&leased[0].task_id, "rejected").await.unwrap();

        let retention = Duration::from_secs(3600);
        assert_eq!(q.purge_failed(retention).await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(1800));
        q.fail(&leased[1].task_id, "rejected").await.unwrap();
        clock.advance(chrono::Duration::seconds(1801));

        assert_eq!(q.purge_failed(retention).await.unwrap(), 1);
        assert_eq!(
            q.failed().await,
            vec![(Task::create_instance("p-1"), "rejected".to_string())]
        );
        assert_eq!(q.tasks(Queue::CreateInstance).await, vec![Task::create_instance("p-2")]);
    }
}
