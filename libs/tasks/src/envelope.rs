//! Queue envelope wrapping a task payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::types::{Queue, Task};

/// A task as stored on and delivered by a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// ULID assigned at enqueue time.
    pub task_id: String,
    pub queue: Queue,
    pub task: Task,
    /// Number of deliveries so far, including the current one.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Wrap a freshly enqueued task.
    pub fn new(task: Task, now: DateTime<Utc>) -> Self {
        Self {
            task_id: Ulid::new().to_string(),
            queue: task.queue(),
            task,
            attempt: 0,
            enqueued_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_takes_queue_from_task() {
        let env = TaskEnvelope::new(Task::manage_bot("p-0"), Utc::now());
        assert_eq!(env.queue, Queue::ManageBot);
        assert_eq!(env.attempt, 0);
        assert!(env.task_id.parse::<Ulid>().is_ok());
    }

    #[test]
    fn test_envelope_ids_are_unique() {
        let now = Utc::now();
        let a = TaskEnvelope::new(Task::manage_bot("p-0"), now);
        let b = TaskEnvelope::new(Task::manage_bot("p-0"), now);
        assert_ne!(a.task_id, b.task_id);
    }
}
