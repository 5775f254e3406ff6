//! # PgQueue
//!
//! An at-least-once message queue backed by a PostgreSQL table.
//!
//! Claiming a batch hides its messages for a visibility timeout instead of locking
//! them for the duration of processing. A worker that crashes mid-batch never
//! acknowledges, so its messages become visible again once the timeout elapses.
use std::str::FromStr;
use std::time;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;

/// Enumeration of database-related errors in PgQueue.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// Enumeration of possible statuses for a queued message.
#[derive(Debug, PartialEq, sqlx::Type)]
#[sqlx(type_name = "message_status")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be claimed, or claimed and hidden until `scheduled_at`.
    Available,
    /// Acknowledged: fully processed, never delivered again.
    Completed,
    /// Dead-lettered: will never succeed and is kept only for inspection.
    Failed,
}

/// A message claimed from a `PgQueue`.
#[derive(sqlx::FromRow, Debug)]
pub struct QueueMessage {
    /// A unique id identifying a message.
    pub id: i64,
    /// How many times the message has been delivered, including this delivery.
    pub attempt: i32,
    /// Identifiers of every worker that claimed this message.
    pub attempted_by: Vec<String>,
    /// The serialized payload, exactly as the producer enqueued it.
    pub body: String,
    pub created_at: chrono::DateTime<chrono::offset::Utc>,
    /// Deliveries allowed before a retryable failure is dead-lettered instead.
    pub max_attempts: i32,
    /// The queue this message belongs to.
    pub queue: String,
    pub status: MessageStatus,
}

impl QueueMessage {
    /// Return true if this delivery is greater or equal to the maximum number of possible attempts.
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A name to identify this PgQueue as multiple may share a table.
    name: String,
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
}

pub type PgQueueResult<T> = std::result::Result<T, DatabaseError>;

impl PgQueue {
    /// Initialize a new PgQueue with a lazily-connecting pool to the database in `url`.
    pub fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
    ) -> PgQueueResult<Self> {
        let name = queue_name.to_owned();
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| DatabaseError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { name, pool })
    }

    /// Initialize a new PgQueue from a provided connection pool.
    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> PgQueue {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pool this queue runs on, shared with other tables in the same database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Claim up to `limit` visible messages, hiding them for `visibility_timeout`.
    pub async fn dequeue_batch(
        &self,
        attempted_by: &str,
        limit: u32,
        visibility_timeout: time::Duration,
    ) -> PgQueueResult<Vec<QueueMessage>> {
        // FOR UPDATE SKIP LOCKED lets concurrent workers claim disjoint batches.
        let base_query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        message_queue
    WHERE
        status = 'available'
        AND scheduled_at <= NOW()
        AND queue = $1
    ORDER BY
        attempt,
        scheduled_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE
    message_queue
SET
    attempted_at = NOW(),
    scheduled_at = NOW() + $4,
    attempt = attempt + 1,
    attempted_by = array_append(attempted_by, $3::text)
FROM
    available_in_queue
WHERE
    message_queue.id = available_in_queue.id
RETURNING
    message_queue.*
        "#;

        sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(limit as i64)
            .bind(attempted_by)
            .bind(visibility_timeout)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })
    }

    /// Acknowledge messages so they are never delivered again.
    pub async fn complete(&self, ids: &[i64]) -> PgQueueResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let base_query = r#"
UPDATE
    message_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'completed'::message_status
WHERE
    queue = $1
    AND id = ANY($2)
        "#;

        let result = sqlx::query(base_query)
            .bind(&self.name)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    /// Move a message out of the retry path, recording why.
    pub async fn dead_letter<E>(&self, id: i64, error: E) -> PgQueueResult<()>
    where
        E: serde::Serialize + std::marker::Sync + std::marker::Send,
    {
        let json_error = sqlx::types::Json(error);
        let base_query = r#"
UPDATE
    message_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'failed'::message_status,
    errors = array_append(errors, $3)
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.name)
            .bind(id)
            .bind(&json_error)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Make a message visible again after `retry_interval`, recording why it failed.
    pub async fn retry<E>(
        &self,
        id: i64,
        error: E,
        retry_interval: time::Duration,
    ) -> PgQueueResult<()>
    where
        E: serde::Serialize + std::marker::Sync + std::marker::Send,
    {
        let json_error = sqlx::types::Json(error);
        let base_query = r#"
UPDATE
    message_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'available'::message_status,
    scheduled_at = NOW() + $3,
    errors = array_append(errors, $4)
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.name)
            .bind(id)
            .bind(retry_interval)
            .bind(&json_error)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Enqueue a serialized message body. Returns the new message id.
    pub async fn enqueue(&self, body: &str, max_attempts: i32) -> PgQueueResult<i64> {
        let base_query = r#"
INSERT INTO message_queue
    (attempt, created_at, scheduled_at, max_attempts, body, queue, status)
VALUES
    (0, NOW(), NOW(), $1, $2, $3, 'available'::message_status)
RETURNING
    id
        "#;

        let (id,): (i64,) = sqlx::query_as(base_query)
            .bind(max_attempts)
            .bind(body)
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(id)
    }
}
