//! Presentation boundary
//!
//! The host implements [`Renderer`] to receive state changes. The core knows
//! nothing about how they are shown. Callbacks may arrive from subscription
//! tasks, so implementations must be `Send + Sync` and should return quickly.

use crate::results::Standings;
use crate::store::StoreKind;
use crate::types::{CandidateId, VoteOutcome};

pub trait Renderer: Send + Sync {
    /// A candidate's count changed
    fn on_tallies_changed(&self, candidate: &CandidateId, new_count: u64);

    /// The global total changed
    fn on_total_changed(&self, new_total: u64);

    /// A cast request finished
    fn on_vote_result(&self, candidate: &CandidateId, outcome: VoteOutcome);

    /// Rankings were recomputed after a tally change
    fn on_standings_changed(&self, _standings: &Standings) {}

    /// The backend serving this session was selected
    fn on_connection_changed(&self, _kind: StoreKind) {}
}

/// Renderer that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn on_tallies_changed(&self, _candidate: &CandidateId, _new_count: u64) {}

    fn on_total_changed(&self, _new_total: u64) {}

    fn on_vote_result(&self, _candidate: &CandidateId, _outcome: VoteOutcome) {}
}
