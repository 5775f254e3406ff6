//! # Selection results
//!
//! The record persisted once per ad-request event. A result is keyed solely by the
//! event's identity and is never mutated after its first successful write.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The candidate that won the selection for an event.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct WinningBid {
    pub advertiser_id: String,
    pub bid_amount: f64,
}

/// Outcome of evaluating one ad-request event.
///
/// `winner` is `None` for a no-fill: the event was evaluated successfully but no
/// candidate was eligible. A no-fill is still persisted so that redelivery of the
/// same event is recognised as already processed.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct SelectionResult {
    pub event_id: String,
    pub content_category: String,
    pub winner: Option<WinningBid>,
    pub winning_score: f64,
    /// Winning score minus the runner-up score.
    pub score_margin: f64,
    /// Name of the scoring policy that produced the scores.
    pub policy: String,
    pub event_timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl SelectionResult {
    /// The persistence key. Derived from the event identity only, never from content.
    pub fn key(&self) -> &str {
        &self.event_id
    }

    pub fn is_no_fill(&self) -> bool {
        self.winner.is_none()
    }

    pub fn winning_advertiser_id(&self) -> Option<&str> {
        self.winner.as_ref().map(|w| w.advertiser_id.as_str())
    }

    /// Time between the event being emitted and its result being produced.
    pub fn end_to_end_latency(&self) -> chrono::Duration {
        self.processed_at - self.event_timestamp
    }
}

/// Flat row shape of `SelectionResult` as stored in PostgreSQL.
#[derive(sqlx::FromRow, Debug)]
pub(crate) struct SelectionRow {
    pub event_id: String,
    pub content_category: String,
    pub winning_advertiser_id: Option<String>,
    pub winning_bid_amount: Option<f64>,
    pub winning_score: f64,
    pub score_margin: f64,
    pub policy: String,
    pub event_timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl From<SelectionRow> for SelectionResult {
    fn from(row: SelectionRow) -> Self {
        let winner = row.winning_advertiser_id.map(|advertiser_id| WinningBid {
            advertiser_id,
            bid_amount: row.winning_bid_amount.unwrap_or_default(),
        });

        Self {
            event_id: row.event_id,
            content_category: row.content_category,
            winner,
            winning_score: row.winning_score,
            score_margin: row.score_margin,
            policy: row.policy,
            event_timestamp: row.event_timestamp,
            processed_at: row.processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_row_without_winner_is_no_fill() {
        let row = SelectionRow {
            event_id: "opp-1".to_owned(),
            content_category: "sports".to_owned(),
            winning_advertiser_id: None,
            winning_bid_amount: None,
            winning_score: 0.0,
            score_margin: 0.0,
            policy: "quality_adjusted".to_owned(),
            event_timestamp: Utc.with_ymd_and_hms(2025, 3, 10, 20, 15, 0).unwrap(),
            processed_at: Utc.with_ymd_and_hms(2025, 3, 10, 20, 15, 1).unwrap(),
        };

        let result = SelectionResult::from(row);

        assert!(result.is_no_fill());
        assert_eq!(result.key(), "opp-1");
        assert_eq!(result.winning_advertiser_id(), None);
        assert_eq!(result.end_to_end_latency(), chrono::Duration::seconds(1));
    }

    #[test]
    fn test_row_with_winner() {
        let row = SelectionRow {
            event_id: "opp-2".to_owned(),
            content_category: "finance".to_owned(),
            winning_advertiser_id: Some("adv_007".to_owned()),
            winning_bid_amount: Some(2.5),
            winning_score: 3.75,
            score_margin: 1.0,
            policy: "quality_adjusted".to_owned(),
            event_timestamp: Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap(),
            processed_at: Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap(),
        };

        let result = SelectionResult::from(row);

        assert_eq!(
            result.winner,
            Some(WinningBid {
                advertiser_id: "adv_007".to_owned(),
                bid_amount: 2.5
            })
        );
        assert!(!result.is_no_fill());
    }
}
