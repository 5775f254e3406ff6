use std::fmt;

use chrono::Timelike;

use crate::event::{AdCandidate, AdRequestEvent};
use crate::scoring::tables::{DeviceBonusTable, RelevanceTable, TimeWindowTable};

/// One named input to a score, kept for observability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreFactor {
    pub name: &'static str,
    pub value: f64,
}

/// The factors a policy combined to reach a score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreRationale(pub Vec<ScoreFactor>);

impl fmt::Display for ScoreRationale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, factor) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={:.4}", factor.name, factor.value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub value: f64,
    pub rationale: ScoreRationale,
}

/// A ranking rule for eligible candidates.
///
/// Implementations must be pure: the same event and candidate always produce the
/// same score, which keeps selection stable across redeliveries.
pub trait ScoringPolicy: Send + Sync {
    /// Stable name, persisted alongside each result.
    fn name(&self) -> &'static str;

    fn score(&self, event: &AdRequestEvent, candidate: &AdCandidate) -> Score;
}

/// `bid * relevance * time-of-day bonus * device bonus`.
#[derive(Debug, Clone, Default)]
pub struct QualityAdjustedPolicy {
    pub relevance: RelevanceTable,
    pub time_windows: TimeWindowTable,
    pub device_bonuses: DeviceBonusTable,
}

impl ScoringPolicy for QualityAdjustedPolicy {
    fn name(&self) -> &'static str {
        "quality_adjusted"
    }

    fn score(&self, event: &AdRequestEvent, candidate: &AdCandidate) -> Score {
        let relevance = self.relevance.multiplier(
            &event.context.content_category,
            candidate.category.as_deref(),
        );
        let time_bonus = self.time_windows.bonus(event.timestamp.hour());
        let device_bonus = self.device_bonuses.bonus(&event.context.device_type);

        Score {
            value: candidate.bid_amount * relevance * time_bonus * device_bonus,
            rationale: ScoreRationale(vec![
                ScoreFactor {
                    name: "bid",
                    value: candidate.bid_amount,
                },
                ScoreFactor {
                    name: "relevance",
                    value: relevance,
                },
                ScoreFactor {
                    name: "time_bonus",
                    value: time_bonus,
                },
                ScoreFactor {
                    name: "device_bonus",
                    value: device_bonus,
                },
            ]),
        }
    }
}

/// `bid_weight * bid + relevance_weight * relevance`.
///
/// Relevance is the candidate's own signal when present, otherwise the table multiplier.
#[derive(Debug, Clone)]
pub struct WeightedPolicy {
    pub bid_weight: f64,
    pub relevance_weight: f64,
    pub relevance: RelevanceTable,
}

impl Default for WeightedPolicy {
    fn default() -> Self {
        Self {
            bid_weight: 1.0,
            relevance_weight: 1.0,
            relevance: RelevanceTable::default(),
        }
    }
}

impl ScoringPolicy for WeightedPolicy {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn score(&self, event: &AdRequestEvent, candidate: &AdCandidate) -> Score {
        let relevance = candidate.relevance.unwrap_or_else(|| {
            self.relevance.multiplier(
                &event.context.content_category,
                candidate.category.as_deref(),
            )
        });

        Score {
            value: self.bid_weight * candidate.bid_amount + self.relevance_weight * relevance,
            rationale: ScoreRationale(vec![
                ScoreFactor {
                    name: "bid",
                    value: candidate.bid_amount,
                },
                ScoreFactor {
                    name: "relevance",
                    value: relevance,
                },
            ]),
        }
    }
}
