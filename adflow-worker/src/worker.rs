use std::collections::HashMap;
use std::time;

use adflow_common::health::HealthHandle;
use adflow_common::pgqueue::{PgQueue, QueueMessage};
use adflow_common::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::event::RawMessage;
use crate::orchestrator::{BatchOrchestrator, BatchReport, OutcomeKind, ProcessingOutcome};

/// Error record appended to a message that is retried or dead-lettered.
#[derive(Serialize, Debug)]
pub struct MessageError {
    pub outcome: &'static str,
    pub detail: Option<String>,
    pub worker: String,
    pub failed_at: DateTime<Utc>,
}

impl MessageError {
    fn new(outcome: &ProcessingOutcome, worker: &str) -> Self {
        Self {
            outcome: outcome.kind.as_str(),
            detail: outcome.detail.clone(),
            worker: worker.to_owned(),
            failed_at: Utc::now(),
        }
    }
}

/// A worker to poll `PgQueue` for batches of ad requests and run them through a
/// `BatchOrchestrator`.
pub struct AdSelectionWorker<'p> {
    /// An identifier for this worker. Used to mark messages we have claimed.
    name: String,
    /// The queue we will be claiming messages from.
    queue: &'p PgQueue,
    orchestrator: BatchOrchestrator,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// Maximum number of messages claimed per batch.
    batch_size: u32,
    /// Time budget for one batch, measured from the moment it is claimed.
    batch_deadline: time::Duration,
    /// How long claimed messages stay hidden from other workers.
    visibility_timeout: time::Duration,
    /// The retry policy used to calculate when transiently failed messages become visible again.
    retry_policy: RetryPolicy,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl<'p> AdSelectionWorker<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: &'p PgQueue,
        orchestrator: BatchOrchestrator,
        poll_interval: time::Duration,
        batch_size: u32,
        batch_deadline: time::Duration,
        visibility_timeout: time::Duration,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            orchestrator,
            poll_interval,
            batch_size,
            batch_deadline,
            visibility_timeout,
            retry_policy,
            liveness,
        }
    }

    /// Wait until at least one message becomes available in our queue.
    async fn wait_for_batch(&self) -> Result<Vec<QueueMessage>, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            let batch = self
                .queue
                .dequeue_batch(&self.name, self.batch_size, self.visibility_timeout)
                .await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }

    /// Run this worker to continuously process any batches that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!(worker = %self.name, queue = self.queue.name(), "starting ad selection worker");

        loop {
            let batch = self.wait_for_batch().await?;
            self.process_batch(batch).await;
        }
    }

    /// Process one claimed batch and settle every message in the queue.
    pub async fn process_batch(&self, batch: Vec<QueueMessage>) -> BatchReport {
        let deadline = Instant::now() + self.batch_deadline;

        let raw = batch
            .iter()
            .map(|message| {
                RawMessage::new(message.id.to_string(), message.body.clone())
                    .with_received_at(message.created_at)
            })
            .collect();
        let messages: HashMap<String, QueueMessage> = batch
            .into_iter()
            .map(|message| (message.id.to_string(), message))
            .collect();

        let report = self.orchestrator.process_until(raw, deadline).await;
        self.apply_report(&report, &messages).await;
        report
    }

    /// Settle each outcome with the queue. Failures here are logged and left to the
    /// visibility timeout: an unsettled message is simply delivered again.
    async fn apply_report(&self, report: &BatchReport, messages: &HashMap<String, QueueMessage>) {
        let completed: Vec<i64> = report
            .completed()
            .into_iter()
            .filter_map(|message_id| messages.get(message_id).map(|message| message.id))
            .collect();

        if let Err(error) = self.queue.complete(&completed).await {
            error!(count = completed.len(), "failed to complete messages: {}", error);
        }

        for outcome in &report.outcomes {
            let Some(message) = messages.get(&outcome.message_id) else {
                continue;
            };
            let message_error = MessageError::new(outcome, &self.name);

            let settled = match outcome.kind {
                OutcomeKind::Success | OutcomeKind::NoEligibleCandidate => continue,
                OutcomeKind::ValidationFailure | OutcomeKind::PermanentError => {
                    self.queue.dead_letter(message.id, message_error).await
                }
                OutcomeKind::TransientError if message.is_gte_max_attempts() => {
                    warn!(
                        message_id = message.id,
                        attempt = message.attempt,
                        "dead-lettering message that exhausted its attempts"
                    );
                    self.queue.dead_letter(message.id, message_error).await
                }
                OutcomeKind::TransientError => {
                    let attempt = u32::try_from(message.attempt).unwrap_or(1);
                    let retry_interval = self.retry_policy.retry_interval(attempt);
                    self.queue
                        .retry(message.id, message_error, retry_interval)
                        .await
                }
            };

            if let Err(error) = settled {
                error!(
                    message_id = message.id,
                    outcome = outcome.kind.as_str(),
                    "failed to settle message: {}",
                    error
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use adflow_common::health::HealthRegistry;
    use adflow_common::pgqueue::MessageStatus;
    use adflow_common::publisher::QueuePublisher;
    use adflow_common::store::{PgResultStore, ResultStore};
    use sqlx::PgPool;

    use crate::orchestrator::PipelineConfig;
    use crate::scoring::policy::QualityAdjustedPolicy;

    fn body(opportunity_id: &str, bids: serde_json::Value) -> String {
        serde_json::json!({
            "opportunity_id": opportunity_id,
            "timestamp": Utc::now().to_rfc3339(),
            "content_category": "sports",
            "device_type": "mobile",
            "bids": bids,
        })
        .to_string()
    }

    async fn status_of(pool: &PgPool, id: i64) -> (MessageStatus, i32) {
        sqlx::query_as("SELECT status, attempt FROM message_queue WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .expect("failed to read message status")
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
    async fn test_batch_is_settled_per_outcome(db: PgPool) {
        let queue = PgQueue::new_from_pool("ad_requests", db.clone());
        let store = Arc::new(PgResultStore::new("selection_results", db.clone()));
        let results = PgQueue::new_from_pool("selection_results", db.clone());
        let orchestrator = BatchOrchestrator::new(
            PipelineConfig::default(),
            Arc::new(QualityAdjustedPolicy::default()),
            store.clone(),
        )
        .with_publisher(Arc::new(QueuePublisher::new(results.clone(), 3)));
        let registry = HealthRegistry::new("liveness");
        let liveness = registry
            .register("worker".to_string(), ::time::Duration::seconds(30))
            .await;

        let winner = queue
            .enqueue(
                &body(
                    "opp-1",
                    serde_json::json!([{"advertiser_id": "adv_001", "bid_amount": 3.5}]),
                ),
                3,
            )
            .await
            .unwrap();
        let no_fill = queue
            .enqueue(&body("opp-2", serde_json::json!([])), 3)
            .await
            .unwrap();
        let malformed = queue.enqueue("{not json", 3).await.unwrap();

        let worker = AdSelectionWorker::new(
            "test-worker",
            &queue,
            orchestrator,
            time::Duration::from_millis(10),
            10,
            time::Duration::from_secs(5),
            time::Duration::from_secs(60),
            RetryPolicy::default(),
            liveness,
        );

        let batch = worker.wait_for_batch().await.unwrap();
        assert_eq!(batch.len(), 3);
        let report = worker.process_batch(batch).await;

        assert_eq!(report.count(OutcomeKind::Success), 1);
        assert_eq!(report.count(OutcomeKind::NoEligibleCandidate), 1);
        assert_eq!(report.count(OutcomeKind::ValidationFailure), 1);

        assert_eq!(status_of(&db, winner).await.0, MessageStatus::Completed);
        assert_eq!(status_of(&db, no_fill).await.0, MessageStatus::Completed);
        assert_eq!(status_of(&db, malformed).await.0, MessageStatus::Failed);

        let stored = store.read("opp-1").await.unwrap().unwrap();
        assert_eq!(stored.winning_advertiser_id(), Some("adv_001"));
        assert!(store.read("opp-2").await.unwrap().unwrap().is_no_fill());

        let published = results
            .dequeue_batch("downstream", 10, time::Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(published.len(), 2);
    }
}
