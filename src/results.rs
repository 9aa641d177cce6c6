//! Rankings and vote shares derived from the current tallies
//!
//! A pure function of (roster, counts). Rankings are descending by count;
//! equal counts keep roster order, so the same tallies always rank the same
//! way. Shares are taken against the sum of the candidate counts, not the
//! separately maintained `totalVotes`, so they add up to ~100 even while the
//! total lags.

use crate::types::{CandidateId, Roster};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Podium marker for the top three places
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Medal {
    Gold,
    Silver,
    Bronze,
}

impl Medal {
    fn for_position(position: usize) -> Option<Self> {
        match position {
            1 => Some(Medal::Gold),
            2 => Some(Medal::Silver),
            3 => Some(Medal::Bronze),
            _ => None,
        }
    }
}

/// Aggregated result for one candidate
///
/// # Examples
///
/// ```rust
/// use tally::results::VoteResult;
/// use tally::types::CandidateId;
///
/// let result = VoteResult {
///     position: 1,
///     candidate_id: CandidateId::new("pam").unwrap(),
///     candidate_name: "The hockey player".to_string(),
///     vote_count: 12,
///     percentage: 48.0,
///     medal: None,
/// };
///
/// println!("{}. {}: {} votes ({:.1}%)",
///          result.position,
///          result.candidate_name,
///          result.vote_count,
///          result.percentage);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResult {
    /// 1-based rank; tied candidates still get consecutive positions
    pub position: usize,

    pub candidate_id: CandidateId,

    pub candidate_name: String,

    pub vote_count: u64,

    /// Share of all counted votes, rounded to one decimal; `0.0` when
    /// nothing has been counted
    pub percentage: f64,

    /// Set for the top three places once at least one vote is counted
    pub medal: Option<Medal>,
}

/// Full projection for one tally state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Standings {
    /// Sum of the candidate counts; may run ahead of the stored
    /// `totalVotes`, which is maintained separately
    pub counted: u64,
    pub rankings: Vec<VoteResult>,
}

impl Standings {
    pub fn leader(&self) -> Option<&VoteResult> {
        self.rankings.first().filter(|r| r.vote_count > 0)
    }

    pub fn get(&self, candidate: &CandidateId) -> Option<&VoteResult> {
        self.rankings.iter().find(|r| &r.candidate_id == candidate)
    }
}

pub struct ResultsProjector;

impl ResultsProjector {
    /// Rank every roster candidate by its count
    ///
    /// Candidates without an entry in `counts` count as zero; entries for
    /// ids outside the roster are ignored.
    pub fn project(roster: &Roster, counts: &HashMap<CandidateId, u64>) -> Standings {
        let mut entries: Vec<_> = roster
            .iter()
            .map(|c| (c, counts.get(&c.id).copied().unwrap_or(0)))
            .collect();

        // sort_by is stable: ties stay in roster order
        entries.sort_by(|(_, a), (_, b)| b.cmp(a));

        let counted: u64 = entries.iter().map(|(_, count)| count).sum();

        let rankings = entries
            .into_iter()
            .enumerate()
            .map(|(index, (candidate, count))| {
                let position = index + 1;
                VoteResult {
                    position,
                    candidate_id: candidate.id.clone(),
                    candidate_name: candidate.display.name.clone(),
                    vote_count: count,
                    percentage: Self::share(count, counted),
                    medal: if counted > 0 { Medal::for_position(position) } else { None },
                }
            })
            .collect();

        Standings { counted, rankings }
    }

    /// `count / total` as a percentage with one decimal, or `0.0` for an
    /// empty tally
    pub fn share(count: u64, total: u64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (count as f64 * 1000.0 / total as f64).round() / 10.0
    }
}
