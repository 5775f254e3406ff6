//! Candidate scoring: eligibility filtering followed by a pluggable ranking policy.
use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::ScoringError;
use crate::event::{AdCandidate, AdRequestEvent};

pub mod eligibility;
pub mod policy;
pub mod tables;

use eligibility::{Exclusion, ExclusionReason};
use policy::{ScoreRationale, ScoringPolicy};
use tables::CategoryList;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: AdCandidate,
    pub score: f64,
    pub rationale: ScoreRationale,
}

impl ScoredCandidate {
    pub fn advertiser_id(&self) -> &str {
        &self.candidate.advertiser_id
    }
}

/// Total order over scored candidates: highest score first, then advertiser id ascending.
pub fn rank(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.advertiser_id().cmp(b.advertiser_id()))
}

/// Eligible candidates in rank order, plus everything that was filtered out and why.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scoring {
    pub scored: Vec<ScoredCandidate>,
    pub excluded: Vec<Exclusion>,
}

#[derive(Clone)]
pub struct CandidateScorer {
    policy: Arc<dyn ScoringPolicy>,
    blocked_advertiser_categories: CategoryList,
    blocked_content_categories: CategoryList,
}

impl CandidateScorer {
    pub fn new(policy: Arc<dyn ScoringPolicy>) -> Self {
        Self {
            policy,
            blocked_advertiser_categories: CategoryList::default(),
            blocked_content_categories: CategoryList::default(),
        }
    }

    pub fn with_blocked_advertiser_categories(mut self, categories: CategoryList) -> Self {
        self.blocked_advertiser_categories = categories;
        self
    }

    pub fn with_blocked_content_categories(mut self, categories: CategoryList) -> Self {
        self.blocked_content_categories = categories;
        self
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Score every eligible candidate of `event`.
    ///
    /// An empty `scored` list is not an error: it means no candidate qualified.
    /// A blocked content category rejects the whole request.
    pub fn score(
        &self,
        event: &AdRequestEvent,
        candidates: &[AdCandidate],
    ) -> Result<Scoring, ScoringError> {
        if self
            .blocked_content_categories
            .contains(&event.context.content_category)
        {
            return Err(ScoringError::BlockedPlacement(
                event.context.content_category.clone(),
            ));
        }

        let mut scoring = Scoring::default();

        for candidate in candidates {
            if let Err(reason) =
                eligibility::check(event, candidate, &self.blocked_advertiser_categories)
            {
                scoring.excluded.push(Exclusion {
                    advertiser_id: candidate.advertiser_id.clone(),
                    reason,
                });
                continue;
            }

            let score = self.policy.score(event, candidate);
            if !score.value.is_finite() {
                scoring.excluded.push(Exclusion {
                    advertiser_id: candidate.advertiser_id.clone(),
                    reason: ExclusionReason::InvalidScore,
                });
                continue;
            }

            scoring.scored.push(ScoredCandidate {
                candidate: candidate.clone(),
                score: score.value,
                rationale: score.rationale,
            });
        }

        scoring.scored.sort_by(rank);
        Ok(scoring)
    }
}
