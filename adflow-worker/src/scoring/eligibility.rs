use std::fmt;

use crate::event::{AdCandidate, AdRequestEvent};
use crate::scoring::tables::CategoryList;

/// Why a candidate was dropped before ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExclusionReason {
    /// Missing, zero or negative bid.
    NoBid,
    /// Flagged as blocked, or advertiser category on the block list.
    PolicyBlocked,
    Expired,
    BudgetExhausted,
    /// The policy produced a NaN or infinite score.
    InvalidScore,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::NoBid => "no_bid",
            ExclusionReason::PolicyBlocked => "policy_blocked",
            ExclusionReason::Expired => "expired",
            ExclusionReason::BudgetExhausted => "budget_exhausted",
            ExclusionReason::InvalidScore => "invalid_score",
        }
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    pub advertiser_id: String,
    pub reason: ExclusionReason,
}

/// Check a candidate against the eligibility rules, in order. The first failing rule wins.
pub fn check(
    event: &AdRequestEvent,
    candidate: &AdCandidate,
    blocked_categories: &CategoryList,
) -> Result<(), ExclusionReason> {
    if candidate.bid_amount.is_nan() || candidate.bid_amount <= 0.0 {
        return Err(ExclusionReason::NoBid);
    }

    let category_blocked = candidate
        .category
        .as_deref()
        .is_some_and(|category| blocked_categories.contains(category));
    if candidate.blocked || category_blocked {
        return Err(ExclusionReason::PolicyBlocked);
    }

    if candidate
        .expires_at
        .is_some_and(|expires_at| expires_at <= event.timestamp)
    {
        return Err(ExclusionReason::Expired);
    }

    if candidate
        .remaining_budget
        .is_some_and(|budget| budget < candidate.bid_amount)
    {
        return Err(ExclusionReason::BudgetExhausted);
    }

    Ok(())
}
