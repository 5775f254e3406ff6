//! Structured records for every event outcome and every batch.
//!
//! Each record is a `tracing` event paired with `metrics` updates. Both APIs are
//! infallible, so emitting can never change an outcome.
use tracing::{debug, error, info, warn};

use crate::orchestrator::{BatchReport, OutcomeKind, ProcessingOutcome};
use crate::scoring::eligibility::Exclusion;

pub fn emit_exclusions(event_id: &str, exclusions: &[Exclusion]) {
    for exclusion in exclusions {
        debug!(
            event_id,
            advertiser_id = %exclusion.advertiser_id,
            reason = %exclusion.reason,
            "excluded candidate"
        );
        metrics::counter!(
            "adflow_candidates_excluded_total",
            "reason" => exclusion.reason.as_str()
        )
        .increment(1);
    }
}

pub fn emit_event_outcome(outcome: &ProcessingOutcome) {
    let kind = outcome.kind.as_str();
    let latency_ms = outcome.latency.as_secs_f64() * 1000.0;
    let event_id = outcome.event_id.as_deref().unwrap_or_default();
    let detail = outcome.detail.as_deref().unwrap_or_default();
    let winner = outcome.winner.as_deref().unwrap_or_default();
    let score = outcome.score.unwrap_or_default();
    let rationale = outcome.rationale.as_deref().unwrap_or_default();
    let field = outcome.field.as_deref().unwrap_or_default();

    match outcome.kind {
        OutcomeKind::Success | OutcomeKind::NoEligibleCandidate => info!(
            message_id = %outcome.message_id,
            event_id,
            outcome = kind,
            latency_ms,
            winner,
            score,
            rationale,
            duplicate = outcome.duplicate,
            "processed ad request"
        ),
        OutcomeKind::ValidationFailure => warn!(
            message_id = %outcome.message_id,
            outcome = kind,
            latency_ms,
            field,
            detail,
            "rejected malformed ad request"
        ),
        OutcomeKind::TransientError => warn!(
            message_id = %outcome.message_id,
            event_id,
            outcome = kind,
            latency_ms,
            detail,
            "ad request not processed"
        ),
        OutcomeKind::PermanentError => error!(
            message_id = %outcome.message_id,
            event_id,
            outcome = kind,
            latency_ms,
            detail,
            "ad request failed permanently"
        ),
    }

    metrics::counter!("adflow_events_total", "outcome" => kind).increment(1);
    metrics::histogram!("adflow_event_duration_seconds", "outcome" => kind)
        .record(outcome.latency.as_secs_f64());
}

pub fn emit_batch_report(report: &BatchReport) {
    let counts = &report.counts;

    info!(
        batch_size = report.outcomes.len(),
        success = counts.success,
        no_fill = counts.no_fill,
        validation_failure = counts.validation_failure,
        transient_error = counts.transient_error,
        permanent_error = counts.permanent_error,
        elapsed_ms = report.elapsed.as_secs_f64() * 1000.0,
        "processed batch"
    );

    metrics::counter!("adflow_batches_total").increment(1);
    metrics::histogram!("adflow_batch_duration_seconds").record(report.elapsed.as_secs_f64());
    metrics::histogram!("adflow_batch_size").record(report.outcomes.len() as f64);
}
