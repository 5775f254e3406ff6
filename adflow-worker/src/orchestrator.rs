//! # Batch orchestrator
//!
//! Drives one batch of raw messages through decode, score, select and write.
//!
//! Every message runs in its own task: a malformed body, a store failure or even a
//! panic in one event is classified into that event's `ProcessingOutcome` and never
//! reaches the others. Outcomes are gathered with a fold into a `BatchReport`, which
//! tells the queue layer what to acknowledge and what to redeliver.
use std::sync::Arc;
use std::time;

use adflow_common::publisher::ResultPublisher;
use adflow_common::selection::{SelectionResult, WinningBid};
use adflow_common::store::ResultStore;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::time::Instant;

use crate::decoder::Decoder;
use crate::error::ScoringError;
use crate::event::RawMessage;
use crate::observability;
use crate::scoring::policy::ScoringPolicy;
use crate::scoring::tables::CategoryList;
use crate::scoring::CandidateScorer;
use crate::selector::select;
use crate::writer::ResultWriter;

/// Runtime tunables of the pipeline. Built from `Config` by the binary.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_timestamp_skew: chrono::Duration,
    pub max_concurrent_events: usize,
    /// How long before the batch deadline we stop starting new work.
    pub deadline_margin: time::Duration,
    pub blocked_advertiser_categories: CategoryList,
    pub blocked_content_categories: CategoryList,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_timestamp_skew: chrono::Duration::seconds(300),
            max_concurrent_events: 16,
            deadline_margin: time::Duration::from_millis(500),
            blocked_advertiser_categories: CategoryList::default(),
            blocked_content_categories: CategoryList::default(),
        }
    }
}

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Success,
    /// Evaluated successfully with no eligible candidate. Terminal, like `Success`.
    NoEligibleCandidate,
    ValidationFailure,
    TransientError,
    PermanentError,
}

/// What the queue layer should do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Complete,
    DeadLetter,
    Retry,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::NoEligibleCandidate => "no_fill",
            OutcomeKind::ValidationFailure => "validation_failure",
            OutcomeKind::TransientError => "transient_error",
            OutcomeKind::PermanentError => "permanent_error",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            OutcomeKind::Success | OutcomeKind::NoEligibleCandidate => Disposition::Complete,
            OutcomeKind::ValidationFailure | OutcomeKind::PermanentError => {
                Disposition::DeadLetter
            }
            OutcomeKind::TransientError => Disposition::Retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingOutcome {
    /// Queue identity. Always present, even when the body could not be decoded.
    pub message_id: String,
    pub event_id: Option<String>,
    pub kind: OutcomeKind,
    pub detail: Option<String>,
    /// Path of the offending field for a `ValidationFailure`.
    pub field: Option<String>,
    pub latency: time::Duration,
    /// The result had already been written by an earlier delivery. Winner and score
    /// are then the stored ones.
    pub duplicate: bool,
    pub winner: Option<String>,
    pub score: Option<f64>,
    /// Factors behind the winner's score, e.g. `bid=3.5000 relevance=1.4000`.
    pub rationale: Option<String>,
}

impl ProcessingOutcome {
    fn new(message_id: &str, kind: OutcomeKind, started: Instant) -> Self {
        Self {
            message_id: message_id.to_owned(),
            event_id: None,
            kind,
            detail: None,
            field: None,
            latency: started.elapsed(),
            duplicate: false,
            winner: None,
            score: None,
            rationale: None,
        }
    }

    fn with_event_id(mut self, event_id: &str) -> Self {
        self.event_id = Some(event_id.to_owned());
        self
    }

    fn with_detail(mut self, detail: impl ToString) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub success: usize,
    pub no_fill: usize,
    pub validation_failure: usize,
    pub transient_error: usize,
    pub permanent_error: usize,
}

impl OutcomeCounts {
    fn add(mut self, kind: OutcomeKind) -> Self {
        match kind {
            OutcomeKind::Success => self.success += 1,
            OutcomeKind::NoEligibleCandidate => self.no_fill += 1,
            OutcomeKind::ValidationFailure => self.validation_failure += 1,
            OutcomeKind::TransientError => self.transient_error += 1,
            OutcomeKind::PermanentError => self.permanent_error += 1,
        }
        self
    }

    pub fn get(&self, kind: OutcomeKind) -> usize {
        match kind {
            OutcomeKind::Success => self.success,
            OutcomeKind::NoEligibleCandidate => self.no_fill,
            OutcomeKind::ValidationFailure => self.validation_failure,
            OutcomeKind::TransientError => self.transient_error,
            OutcomeKind::PermanentError => self.permanent_error,
        }
    }
}

/// Every outcome of one batch, one per input message, in no particular order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub outcomes: Vec<ProcessingOutcome>,
    pub counts: OutcomeCounts,
    pub elapsed: time::Duration,
}

impl BatchReport {
    pub fn new(outcomes: Vec<ProcessingOutcome>, elapsed: time::Duration) -> Self {
        let counts = outcomes
            .iter()
            .fold(OutcomeCounts::default(), |counts, outcome| {
                counts.add(outcome.kind)
            });

        Self {
            outcomes,
            counts,
            elapsed,
        }
    }

    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.counts.get(kind)
    }

    fn message_ids(&self, disposition: Disposition) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.kind.disposition() == disposition)
            .map(|outcome| outcome.message_id.as_str())
            .collect()
    }

    /// Terminal successes: Success and NoEligibleCandidate.
    pub fn completed(&self) -> Vec<&str> {
        self.message_ids(Disposition::Complete)
    }

    /// Poison pills: ValidationFailure and PermanentError. Never retried.
    pub fn dead_letter(&self) -> Vec<&str> {
        self.message_ids(Disposition::DeadLetter)
    }

    /// TransientError: leave unacknowledged for redelivery.
    pub fn retry(&self) -> Vec<&str> {
        self.message_ids(Disposition::Retry)
    }

    /// Everything that must be removed from the main queue path.
    pub fn acknowledge(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.kind.disposition() != Disposition::Retry)
            .map(|outcome| outcome.message_id.as_str())
            .collect()
    }
}

/// Per-event pipeline shared by all tasks of a batch. Holds no mutable state.
#[derive(Clone)]
struct EventPipeline {
    decoder: Decoder,
    scorer: CandidateScorer,
    writer: ResultWriter,
    clock: fn() -> DateTime<Utc>,
}

impl EventPipeline {
    async fn process(&self, message: &RawMessage, cutoff: Option<Instant>) -> ProcessingOutcome {
        let started = Instant::now();
        let message_id = message.message_id.as_str();

        if cutoff.is_some_and(|cutoff| started >= cutoff) {
            return ProcessingOutcome::new(message_id, OutcomeKind::TransientError, started)
                .with_detail("batch deadline reached before processing started");
        }

        let event = match self.decoder.decode(message, (self.clock)()) {
            Ok(event) => event,
            Err(error) => {
                let mut outcome =
                    ProcessingOutcome::new(message_id, OutcomeKind::ValidationFailure, started);
                outcome.field = Some(error.field.clone());
                return outcome.with_detail(error);
            }
        };

        let scoring = match self.scorer.score(&event, &event.candidates) {
            Ok(scoring) => scoring,
            Err(error @ ScoringError::BlockedPlacement(_)) => {
                return ProcessingOutcome::new(message_id, OutcomeKind::PermanentError, started)
                    .with_event_id(&event.event_id)
                    .with_detail(error);
            }
        };
        observability::emit_exclusions(&event.event_id, &scoring.excluded);

        let selection = select(&scoring.scored);
        let result = SelectionResult {
            event_id: event.event_id.clone(),
            content_category: event.context.content_category.clone(),
            winner: selection.winner().map(|winner| WinningBid {
                advertiser_id: winner.candidate.advertiser_id.clone(),
                bid_amount: winner.candidate.bid_amount,
            }),
            winning_score: selection.winning_score(),
            score_margin: selection.score_margin(),
            policy: self.scorer.policy_name().to_owned(),
            event_timestamp: event.timestamp,
            processed_at: (self.clock)(),
        };

        let written = match cutoff {
            Some(cutoff) => match tokio::time::timeout_at(cutoff, self.writer.write(result)).await {
                Ok(written) => written,
                Err(_) => {
                    return ProcessingOutcome::new(
                        message_id,
                        OutcomeKind::TransientError,
                        started,
                    )
                    .with_event_id(&event.event_id)
                    .with_detail("batch deadline reached before the result was written");
                }
            },
            None => self.writer.write(result).await,
        };

        let recorded = match written {
            Ok(recorded) => recorded,
            Err(error) => {
                let kind = if error.is_transient() {
                    OutcomeKind::TransientError
                } else {
                    OutcomeKind::PermanentError
                };
                return ProcessingOutcome::new(message_id, kind, started)
                    .with_event_id(&event.event_id)
                    .with_detail(error);
            }
        };

        let stored = &recorded.result;
        let kind = if stored.is_no_fill() {
            OutcomeKind::NoEligibleCandidate
        } else {
            OutcomeKind::Success
        };

        let mut outcome =
            ProcessingOutcome::new(message_id, kind, started).with_event_id(&event.event_id);
        outcome.duplicate = recorded.is_duplicate();
        outcome.winner = stored.winning_advertiser_id().map(str::to_owned);
        outcome.score = Some(stored.winning_score);
        // Rationale covers this delivery's scoring: omitted when the stored winner differs.
        outcome.rationale = selection
            .winner()
            .filter(|winner| Some(winner.advertiser_id()) == stored.winning_advertiser_id())
            .map(|winner| winner.rationale.to_string());
        outcome
    }
}

pub struct BatchOrchestrator {
    pipeline: Arc<EventPipeline>,
    config: PipelineConfig,
}

impl BatchOrchestrator {
    pub fn new(
        config: PipelineConfig,
        policy: Arc<dyn ScoringPolicy>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let scorer = CandidateScorer::new(policy)
            .with_blocked_advertiser_categories(config.blocked_advertiser_categories.clone())
            .with_blocked_content_categories(config.blocked_content_categories.clone());

        Self {
            pipeline: Arc::new(EventPipeline {
                decoder: Decoder::new(config.max_timestamp_skew),
                scorer,
                writer: ResultWriter::new(store),
                clock: Utc::now,
            }),
            config,
        }
    }

    /// Replace the wall clock used for `processed_at` and for skew checks of messages
    /// without a receive time.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        let mut pipeline = (*self.pipeline).clone();
        pipeline.clock = clock;
        self.pipeline = Arc::new(pipeline);
        self
    }

    /// Publish every recorded result, including the stored result of a redelivered event.
    /// A failed publish is reported as the event's outcome.
    pub fn with_publisher(mut self, publisher: Arc<dyn ResultPublisher>) -> Self {
        let mut pipeline = (*self.pipeline).clone();
        pipeline.writer = pipeline.writer.with_publisher(publisher);
        self.pipeline = Arc::new(pipeline);
        self
    }

    /// Process a batch with no deadline.
    pub async fn process(&self, batch: Vec<RawMessage>) -> BatchReport {
        self.run(batch, None).await
    }

    /// Process a batch that must finish by `deadline`.
    ///
    /// Events not yet written when the deadline margin is reached are reported as
    /// `TransientError`, so they are redelivered rather than lost.
    pub async fn process_until(&self, batch: Vec<RawMessage>, deadline: Instant) -> BatchReport {
        let cutoff = deadline
            .checked_sub(self.config.deadline_margin)
            .unwrap_or(deadline);
        self.run(batch, Some(cutoff)).await
    }

    async fn run(&self, batch: Vec<RawMessage>, cutoff: Option<Instant>) -> BatchReport {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_events.max(1)));

        let handles: Vec<_> = batch
            .into_iter()
            .map(|message| {
                let message_id = message.message_id.clone();
                let pipeline = self.pipeline.clone();
                let semaphore = semaphore.clone();

                let handle = tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return ProcessingOutcome::new(
                                &message.message_id,
                                OutcomeKind::TransientError,
                                Instant::now(),
                            )
                            .with_detail("worker is shutting down");
                        }
                    };
                    pipeline.process(&message, cutoff).await
                });

                (message_id, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (message_id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(error) => outcome_from_join_error(&message_id, error, started),
            };
            observability::emit_event_outcome(&outcome);
            outcomes.push(outcome);
        }

        let report = BatchReport::new(outcomes, started.elapsed());
        observability::emit_batch_report(&report);
        report
    }
}

/// A task that did not return an outcome. A panic is a bug and will recur on
/// redelivery, so it is permanent; a cancelled task is retried.
fn outcome_from_join_error(
    message_id: &str,
    error: JoinError,
    started: Instant,
) -> ProcessingOutcome {
    if error.is_panic() {
        let panic = error.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_owned());

        ProcessingOutcome::new(message_id, OutcomeKind::PermanentError, started)
            .with_detail(format!("panicked while processing: {message}"))
    } else {
        ProcessingOutcome::new(message_id, OutcomeKind::TransientError, started)
            .with_detail("processing task was cancelled")
    }
}
