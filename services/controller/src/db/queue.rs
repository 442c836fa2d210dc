//! Durable task queue on Postgres.
//!
//! Workers lease rows with `FOR UPDATE SKIP LOCKED`, so concurrent
//! controllers never lease the same task at the same time. A lease is a
//! `visible_at` in the future; once it passes, the task is deliverable
//! again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, Row};
use tracing::{debug, warn};
use ulid::Ulid;
use vmfleet_tasks::{Queue, Task, TaskEnvelope};

use super::DbError;
use crate::dispatch::{validate_all, DispatchError, Dispatcher, QueueStats, TaskSource};

/// Task queue over a Postgres pool.
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run a statement that must touch exactly the row of `task_id`.
    async fn update_one(
        &self,
        task_id: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), DispatchError> {
        let result = query.execute(&self.pool).await.map_err(DbError::Query)?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::NotFound(task_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for PgTaskQueue {
    async fn add_tasks(&self, tasks: Vec<Task>) -> Result<(), DispatchError> {
        validate_all(&tasks)?;
        if tasks.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        for task in &tasks {
            let payload = serde_json::to_value(task)
                .map_err(|e| DispatchError::Backend(format!("encode task: {e}")))?;
            sqlx::query(
                r#"
                INSERT INTO tasks (task_id, queue, payload, state, attempt, visible_at, enqueued_at)
                VALUES ($1, $2, $3, 'pending', 0, now(), now())
                "#,
            )
            .bind(Ulid::new().to_string())
            .bind(task.queue().as_str())
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }
        tx.commit().await.map_err(DbError::Query)?;

        debug!(count = tasks.len(), "Enqueued tasks");
        Ok(())
    }

    async fn queue_stats(&self) -> Result<Vec<(Queue, QueueStats)>, DispatchError> {
        let rows = sqlx::query(
            r#"
            SELECT queue,
                   COUNT(*) FILTER (WHERE state = 'failed') AS failed,
                   COUNT(*) FILTER (WHERE state = 'leased' AND visible_at > now()) AS leased,
                   COUNT(*) FILTER (WHERE state <> 'failed'
                                    AND NOT (state = 'leased' AND visible_at > now())) AS pending
            FROM tasks
            GROUP BY queue
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut stats: Vec<(Queue, QueueStats)> = Queue::ALL
            .into_iter()
            .map(|q| (q, QueueStats::default()))
            .collect();

        for row in rows {
            let name: String = row.try_get("queue").map_err(DbError::Query)?;
            let Ok(queue) = name.parse::<Queue>() else {
                debug!(queue = %name, "Skipping unknown queue in stats");
                continue;
            };
            let count = |column: &str| -> Result<u64, DbError> {
                let n: i64 = row.try_get(column).map_err(DbError::Query)?;
                Ok(u64::try_from(n).unwrap_or(0))
            };
            if let Some((_, entry)) = stats.iter_mut().find(|(q, _)| *q == queue) {
                *entry = QueueStats {
                    pending: count("pending")?,
                    leased: count("leased")?,
                    failed: count("failed")?,
                };
            }
        }
        Ok(stats)
    }

    async fn purge_failed(&self, older_than: Duration) -> Result<u64, DispatchError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE state = 'failed'
              AND failed_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TaskSource for PgTaskQueue {
    async fn lease(
        &self,
        queue: Queue,
        limit: usize,
        lease_for: Duration,
    ) -> Result<Vec<TaskEnvelope>, DispatchError> {
        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'leased',
                attempt = attempt + 1,
                visible_at = now() + make_interval(secs => $3)
            WHERE task_id IN (
                SELECT task_id FROM tasks
                WHERE queue = $1
                  AND state <> 'failed'
                  AND visible_at <= now()
                ORDER BY visible_at, task_id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING task_id, payload, attempt, enqueued_at
            "#,
        )
        .bind(queue.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(lease_for.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id: String = row.try_get("task_id").map_err(DbError::Query)?;
            match decode_envelope(&row, &task_id, queue) {
                Ok(envelope) => leased.push(envelope),
                Err(e) => {
                    // Parked so it stops occupying lease slots; the rest of
                    // the batch is still delivered.
                    let error = e.to_string();
                    warn!(task_id = %task_id, queue = %queue, error = %error, "Failing undecodable task");
                    self.fail(&task_id, &error).await?;
                }
            }
        }
        Ok(leased)
    }

    async fn complete(&self, task_id: &str) -> Result<(), DispatchError> {
        self.update_one(
            task_id,
            sqlx::query("DELETE FROM tasks WHERE task_id = $1").bind(task_id),
        )
        .await
    }

    async fn retry(
        &self,
        task_id: &str,
        delay: Duration,
        error: &str,
    ) -> Result<(), DispatchError> {
        self.update_one(
            task_id,
            sqlx::query(
                r#"
                UPDATE tasks
                SET state = 'pending',
                    visible_at = now() + make_interval(secs => $2),
                    last_error = $3
                WHERE task_id = $1
                "#,
            )
            .bind(task_id)
            .bind(delay.as_secs_f64())
            .bind(error),
        )
        .await
    }

    async fn fail(&self, task_id: &str, error: &str) -> Result<(), DispatchError> {
        self.update_one(
            task_id,
            sqlx::query(
                r#"
                UPDATE tasks
                SET state = 'failed', failed_at = now(), last_error = $2
                WHERE task_id = $1
                "#,
            )
            .bind(task_id)
            .bind(error),
        )
        .await
    }
}

fn decode_envelope(
    row: &sqlx::postgres::PgRow,
    task_id: &str,
    queue: Queue,
) -> Result<TaskEnvelope, DbError> {
    let payload: serde_json::Value = row.try_get("payload").map_err(DbError::Query)?;
    let attempt: i32 = row.try_get("attempt").map_err(DbError::Query)?;
    let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at").map_err(DbError::Query)?;
    let task: Task = serde_json::from_value(payload)
        .map_err(|e| DbError::InvalidRow(format!("task {task_id}: {e}")))?;
    Ok(TaskEnvelope {
        task_id: task_id.to_string(),
        queue,
        task,
        attempt: u32::try_from(attempt).unwrap_or(0),
        enqueued_at,
    })
}
