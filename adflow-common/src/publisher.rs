//! # Result publisher
//!
//! Hands each recorded `SelectionResult` to downstream consumers through a results
//! queue. Publishing happens after the result is on record, so the hand-off is
//! at-least-once: a redelivered event publishes its stored result again and
//! consumers key on `event_id`.
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::pgqueue::{DatabaseError, PgQueue};
use crate::selection::SelectionResult;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize selection result: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to enqueue selection result: {0}")]
    Queue(#[from] DatabaseError),
    #[error("result publisher is unavailable: {0}")]
    Unavailable(String),
}

impl PublishError {
    /// Whether publishing the same result later could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PublishError::Serialization(_))
    }
}

#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, result: &SelectionResult) -> Result<(), PublishError>;
}

/// Publishes results as JSON messages on a `PgQueue`.
#[derive(Clone)]
pub struct QueuePublisher {
    queue: PgQueue,
    max_attempts: i32,
}

impl QueuePublisher {
    pub fn new(queue: PgQueue, max_attempts: i32) -> Self {
        Self {
            queue,
            max_attempts,
        }
    }
}

#[async_trait]
impl ResultPublisher for QueuePublisher {
    async fn publish(&self, result: &SelectionResult) -> Result<(), PublishError> {
        let body = serde_json::to_string(result)?;
        self.queue.enqueue(&body, self.max_attempts).await?;

        Ok(())
    }
}

/// Collects published results in memory. Used for local runs and tests.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<SelectionResult>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<SelectionResult> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResultPublisher for MemoryPublisher {
    async fn publish(&self, result: &SelectionResult) -> Result<(), PublishError> {
        self.published
            .lock()
            .map_err(|_| PublishError::Unavailable("poisoned publisher lock".to_owned()))?
            .push(result.clone());

        Ok(())
    }
}
