use crate::scoring::{rank, ScoredCandidate};

/// What the selector decided for one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Winner {
        winner: ScoredCandidate,
        /// Winner score minus runner-up score, or the winner's own score when unopposed.
        score_margin: f64,
    },
    /// No eligible candidate. A valid, persisted outcome.
    NoFill,
}

impl Selection {
    pub fn winner(&self) -> Option<&ScoredCandidate> {
        match self {
            Selection::Winner { winner, .. } => Some(winner),
            Selection::NoFill => None,
        }
    }

    pub fn winning_score(&self) -> f64 {
        self.winner().map(|w| w.score).unwrap_or_default()
    }

    pub fn score_margin(&self) -> f64 {
        match self {
            Selection::Winner { score_margin, .. } => *score_margin,
            Selection::NoFill => 0.0,
        }
    }
}

/// Pick the highest-ranked candidate. Input order does not matter.
pub fn select(scored: &[ScoredCandidate]) -> Selection {
    let mut ranked: Vec<&ScoredCandidate> = scored.iter().collect();
    ranked.sort_by(|a, b| rank(a, b));

    match ranked.as_slice() {
        [] => Selection::NoFill,
        [winner] => Selection::Winner {
            winner: (*winner).clone(),
            score_margin: winner.score,
        },
        [winner, runner_up, ..] => Selection::Winner {
            winner: (*winner).clone(),
            score_margin: winner.score - runner_up.score,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AdCandidate;
    use crate::scoring::policy::ScoreRationale;

    fn scored(advertiser_id: &str, score: f64) -> ScoredCandidate {
        ScoredCandidate {
            candidate: AdCandidate {
                advertiser_id: advertiser_id.to_owned(),
                bid_amount: score,
                category: None,
                relevance: None,
                expires_at: None,
                remaining_budget: None,
                blocked: false,
            },
            score,
            rationale: ScoreRationale::default(),
        }
    }

    #[test]
    fn test_empty_is_no_fill() {
        let selection = select(&[]);

        assert_eq!(selection, Selection::NoFill);
        assert_eq!(selection.winning_score(), 0.0);
        assert_eq!(selection.score_margin(), 0.0);
    }

    #[test]
    fn test_highest_score_wins_regardless_of_order() {
        let selection = select(&[scored("adv_low", 0.4), scored("adv_high", 0.9)]);

        assert_eq!(selection.winner().unwrap().advertiser_id(), "adv_high");
        assert_eq!(selection.winning_score(), 0.9);
        assert!((selection.score_margin() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_sole_candidate_margin_is_its_score() {
        let selection = select(&[scored("adv_001", 6.7375)]);

        assert_eq!(selection.score_margin(), 6.7375);
    }

    #[test]
    fn test_ties_break_by_advertiser_id() {
        let forward = [scored("adv_b", 1.0), scored("adv_a", 1.0)];
        let backward = [scored("adv_a", 1.0), scored("adv_b", 1.0)];

        for _ in 0..5 {
            assert_eq!(select(&forward).winner().unwrap().advertiser_id(), "adv_a");
            assert_eq!(select(&backward).winner().unwrap().advertiser_id(), "adv_a");
        }
        assert_eq!(select(&forward).score_margin(), 0.0);
    }
}
