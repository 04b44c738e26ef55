use crate::reputation::Reputation;
use serde::{Deserialize, Serialize};

const MAX_SCORE: u8 = 100;
const BLACKLIST_PENALTY: u8 = 50;
const UNKNOWN_REPUTATION_PENALTY: u8 = 20;

/// Rule table used to turn the two signals into a confidence score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringPolicy {
    /// 100, minus 50 when blacklisted, minus 20 when the reputation is unknown.
    #[default]
    Additive,
    /// Blacklisted is 0 outright, otherwise 100 for good and 50 for unknown.
    Tiered,
}

impl ScoringPolicy {
    pub fn score(self, blacklisted: bool, reputation: Reputation) -> u8 {
        match self {
            ScoringPolicy::Additive => additive_score(blacklisted, reputation),
            ScoringPolicy::Tiered => match (blacklisted, reputation) {
                (true, _) => 0,
                (false, Reputation::Good) => MAX_SCORE,
                (false, Reputation::Unknown) => 50,
            },
        }
    }
}

/// The canonical score table.
pub fn additive_score(blacklisted: bool, reputation: Reputation) -> u8 {
    let mut score = MAX_SCORE;

    if blacklisted {
        score = score.saturating_sub(BLACKLIST_PENALTY);
    }
    if reputation == Reputation::Unknown {
        score = score.saturating_sub(UNKNOWN_REPUTATION_PENALTY);
    }

    score
}
