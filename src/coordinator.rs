//! Voting coordinator: the per-device state machine
//!
//! This module implements exactly-once voting for one device:
//! 1. Local fast-path reject once this device is known to have voted
//! 2. Atomic vote transaction against the shared store
//! 3. Local record written only after the store confirms
//! 4. Store-reported duplicates reconciled into the local record
//! 5. Store failures reported as retryable, never counted
//!
//! A cast runs on its own task. Dropping the `cast_vote` future abandons the
//! wait, not the transaction: the store operation and the local bookkeeping
//! that follows it still finish (or fail) as a unit, and the coordinator
//! never retries on the caller's behalf.

use crate::config::Config;
use crate::local::{DeviceIdentity, FileStore, LocalElectionCache, LocalStore};
use crate::renderer::Renderer;
use crate::results::{ResultsProjector, Standings};
use crate::store::{self, StoreKind, Subscription, TallyStore};
use crate::types::{CandidateId, CastResult, DeviceId, Roster, TallySnapshot, VoteOutcome, VoterState};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Latest known tallies, fed by store subscriptions and confirmed commits
///
/// Counts only move forward: no vote is ever retracted, so a lower value
/// than the one already seen is a stale read and is ignored.
#[derive(Debug, Clone, Default)]
pub struct TallyBoard {
    counts: HashMap<CandidateId, u64>,
    total: Option<u64>,
}

impl TallyBoard {
    /// Record a candidate count; `true` if the board changed
    pub fn observe_count(&mut self, candidate: &CandidateId, count: u64) -> bool {
        match self.counts.get(candidate) {
            Some(&seen) if seen >= count => false,
            _ => {
                self.counts.insert(candidate.clone(), count);
                true
            }
        }
    }

    /// Record the global total; `true` if the board changed
    pub fn observe_total(&mut self, total: u64) -> bool {
        match self.total {
            Some(seen) if seen >= total => false,
            _ => {
                self.total = Some(total);
                true
            }
        }
    }

    pub fn count(&self, candidate: &CandidateId) -> u64 {
        self.counts.get(candidate).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total.unwrap_or(0)
    }

    pub fn standings(&self, roster: &Roster) -> Standings {
        ResultsProjector::project(roster, &self.counts)
    }
}

/// What startup reconciliation did to the local record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The store does not outlive this process; the local record stands
    Skipped,
    /// The store could not be asked; the local record stands
    Unreachable,
    /// Local record and store agree
    InSync,
    /// The store knew a vote the local record did not
    Adopted(CandidateId),
    /// The local record named the wrong candidate
    Replaced { local: CandidateId, remote: CandidateId },
    /// The local record claimed a vote the store has never seen
    Cleared,
}

struct Inner {
    roster: Roster,
    device: DeviceIdentity,
    cache: LocalElectionCache,
    store: Arc<dyn TallyStore>,
    renderer: Arc<dyn Renderer>,
    state: Mutex<VoterState>,
    /// Held by a cast's store transaction and by reconciliation, so neither
    /// acts on a local record the other is about to change
    gate: tokio::sync::Mutex<()>,
    board: Mutex<TallyBoard>,
    /// Held while notifying the renderer so notifications keep board order
    emit: Mutex<()>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Inner {
    fn lock_state(&self) -> Result<MutexGuard<'_, VoterState>> {
        self.state
            .lock()
            .map_err(|_| Error::internal("Voter state lock poisoned"))
    }

    fn set_state(&self, next: VoterState) -> Result<()> {
        *self.lock_state()? = next;
        Ok(())
    }

    fn apply_count(&self, candidate: &CandidateId, count: u64) {
        let Ok(mut board) = self.board.lock() else {
            return;
        };
        if !board.observe_count(candidate, count) {
            return;
        }
        let standings = board.standings(&self.roster);

        let _emit = self.emit.lock().unwrap_or_else(PoisonError::into_inner);
        drop(board);

        self.renderer.on_tallies_changed(candidate, count);
        self.renderer.on_standings_changed(&standings);
    }

    fn apply_total(&self, total: u64) {
        let Ok(mut board) = self.board.lock() else {
            return;
        };
        if !board.observe_total(total) {
            return;
        }

        let _emit = self.emit.lock().unwrap_or_else(PoisonError::into_inner);
        drop(board);

        self.renderer.on_total_changed(total);
    }

    /// Write a store-confirmed vote into the local record
    ///
    /// The store is authoritative: a conflicting local record is replaced.
    fn record_locally(&self, candidate: &CandidateId) {
        match self.cache.record_vote(candidate) {
            Ok(()) => {}
            Err(e @ Error::InconsistentLocalState { .. }) => {
                tracing::warn!("{}; trusting the tally store", e);
                let replaced = self
                    .cache
                    .clear()
                    .and_then(|_| self.cache.record_vote(candidate));
                if let Err(e) = replaced {
                    tracing::error!("Cannot correct local election record: {}", e);
                }
            }
            Err(e) => tracing::error!("Cannot record vote locally: {}", e),
        }
    }

    async fn complete_vote(&self, candidate: CandidateId) -> Result<VoteOutcome> {
        let _gate = self.gate.lock().await;

        // Reconciliation may have adopted a vote while this cast waited
        if self.cache.has_voted() {
            self.set_state(VoterState::VotingDenied)?;
            tracing::info!(
                "Device {} already has a recorded vote, cast for {} dropped",
                self.device.id().short(),
                candidate
            );
            self.renderer.on_vote_result(&candidate, VoteOutcome::AlreadyVoted);
            return Ok(VoteOutcome::AlreadyVoted);
        }

        let result = self.store.try_cast_vote(&candidate, self.device.id()).await;

        let outcome = match result {
            Ok(CastResult::Committed { count }) => {
                self.record_locally(&candidate);
                self.set_state(VoterState::Voted)?;
                self.apply_count(&candidate, count);
                tracing::info!(
                    "Vote cast: device={}, candidate={}",
                    self.device.id().short(),
                    candidate
                );
                VoteOutcome::Committed
            }
            Ok(CastResult::AlreadyVoted) => {
                self.record_locally(&candidate);
                self.set_state(VoterState::VotingDenied)?;
                tracing::info!(
                    "Tally store already lists device {} for {}",
                    self.device.id().short(),
                    candidate
                );
                VoteOutcome::AlreadyVoted
            }
            Err(e) => {
                self.set_state(VoterState::NotVoted)?;
                if e.is_transient() {
                    tracing::warn!("Vote for {} not recorded, retry possible: {}", candidate, e);
                } else {
                    tracing::error!("Vote for {} failed: {}", candidate, e);
                }
                VoteOutcome::TransientFailure
            }
        };

        self.renderer.on_vote_result(&candidate, outcome);
        Ok(outcome)
    }
}

/// Coordinates one device's single vote against the shared tally store
#[derive(Clone)]
pub struct VotingCoordinator {
    inner: Arc<Inner>,
}

impl VotingCoordinator {
    pub fn new(
        roster: Roster,
        device: DeviceIdentity,
        cache: LocalElectionCache,
        store: Arc<dyn TallyStore>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        let state = if cache.has_voted() {
            VoterState::Voted
        } else {
            VoterState::NotVoted
        };

        Self {
            inner: Arc::new(Inner {
                roster,
                device,
                cache,
                store,
                renderer,
                state: Mutex::new(state),
                gate: tokio::sync::Mutex::new(()),
                board: Mutex::new(TallyBoard::default()),
                emit: Mutex::new(()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build a ready coordinator from configuration
    ///
    /// Loads (or creates) the device record, selects the store backend,
    /// reconciles the local record and subscribes to live tallies. Failing
    /// to subscribe is logged, not fatal: voting still works.
    pub async fn open(config: &Config, renderer: Arc<dyn Renderer>) -> Result<Self> {
        let local: Arc<dyn LocalStore> = Arc::new(FileStore::new(&config.state_path));
        let device = DeviceIdentity::get_or_create(local.as_ref());
        let cache = LocalElectionCache::open(local);

        let store = store::connect(&config.store).await?;
        renderer.on_connection_changed(store.kind());

        let coordinator = Self::new(config.roster.clone(), device, cache, store, renderer);

        let reconciliation = coordinator.reconcile().await?;
        tracing::info!(
            "Device {} ready ({:?}, {:?})",
            coordinator.device_id().short(),
            coordinator.state(),
            reconciliation
        );

        if let Err(e) = coordinator.start().await {
            tracing::warn!("Live tallies unavailable: {}", e);
        }

        Ok(coordinator)
    }

    /// Cast this device's vote
    ///
    /// Returns `Err` only for an unknown candidate id, before any state
    /// changes. Every other result is a [`VoteOutcome`], also reported to
    /// the renderer.
    pub async fn cast_vote(&self, candidate_id: &str) -> Result<VoteOutcome> {
        let candidate = self.inner.roster.resolve(candidate_id)?.id.clone();

        let early = {
            let mut state = self.inner.lock_state()?;
            if state.has_voted() || self.inner.cache.has_voted() {
                *state = VoterState::VotingDenied;
                Some(VoteOutcome::AlreadyVoted)
            } else if *state == VoterState::Voting {
                // Another cast is in flight; its result decides
                Some(VoteOutcome::TransientFailure)
            } else {
                *state = VoterState::Voting;
                None
            }
        };

        if let Some(outcome) = early {
            tracing::debug!("Cast for {} short-circuited: {:?}", candidate, outcome);
            self.inner.renderer.on_vote_result(&candidate, outcome);
            return Ok(outcome);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.complete_vote(candidate).await })
            .await
            .map_err(|e| Error::internal(format!("Vote task failed: {e}")))?
    }

    /// Bring the local record in line with the tally store
    ///
    /// Only an authoritative store is consulted; the in-memory simulation
    /// cannot know about votes from earlier sessions. Runs exclusively with
    /// cast transactions: a cast started meanwhile waits, then sees the
    /// reconciled record.
    pub async fn reconcile(&self) -> Result<Reconciliation> {
        let inner = &self.inner;
        if !inner.store.is_authoritative() {
            return Ok(Reconciliation::Skipped);
        }
        let _gate = inner.gate.lock().await;

        let remote = match inner.store.find_vote(inner.device.id(), &inner.roster).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("Cannot verify voting status with tally store: {}", e);
                return Ok(Reconciliation::Unreachable);
            }
        };

        let local = inner.cache.voted_candidate();
        let local_voted = inner.cache.has_voted();

        let reconciliation = match (remote, local) {
            (Some(remote), Some(local)) if remote == local => Reconciliation::InSync,
            (Some(remote), Some(local)) => {
                tracing::warn!(
                    "{}; trusting the tally store",
                    Error::inconsistent(local.as_str(), remote.as_str())
                );
                inner.cache.clear()?;
                inner.cache.record_vote(&remote)?;
                Reconciliation::Replaced { local, remote }
            }
            (Some(remote), None) => {
                inner.cache.record_vote(&remote)?;
                Reconciliation::Adopted(remote)
            }
            (None, local) if local_voted || local.is_some() => {
                let recorded = local.map(|c| c.to_string()).unwrap_or_default();
                tracing::warn!(
                    "{}; tally store has no vote from this device, clearing local record",
                    Error::inconsistent(recorded, "none")
                );
                inner.cache.clear()?;
                Reconciliation::Cleared
            }
            (None, _) => Reconciliation::InSync,
        };

        // A queued cast owns the state until its transaction finishes
        let mut state = inner.lock_state()?;
        if *state != VoterState::Voting {
            *state = if inner.cache.has_voted() {
                VoterState::Voted
            } else {
                VoterState::NotVoted
            };
        }
        drop(state);

        Ok(reconciliation)
    }

    /// Subscribe to every candidate count and the total
    pub async fn start(&self) -> Result<()> {
        let mut subscriptions = Vec::with_capacity(self.inner.roster.len() + 1);

        for id in self.inner.roster.ids() {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let candidate = id.clone();
            let subscription = self
                .inner
                .store
                .subscribe_to_candidate(
                    id,
                    Arc::new(move |count: u64| {
                        if let Some(inner) = weak.upgrade() {
                            inner.apply_count(&candidate, count);
                        }
                    }),
                )
                .await?;
            subscriptions.push(subscription);
        }

        let weak = Arc::downgrade(&self.inner);
        let subscription = self
            .inner
            .store
            .subscribe_to_total(Arc::new(move |total: u64| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_total(total);
                }
            }))
            .await?;
        subscriptions.push(subscription);

        let mut active = self
            .inner
            .subscriptions
            .lock()
            .map_err(|_| Error::internal("Subscription list lock poisoned"))?;
        active.extend(subscriptions);
        tracing::info!("Subscribed to {} tally locations", active.len());
        Ok(())
    }

    /// Cancel all live tally subscriptions
    pub fn shutdown(&self) {
        if let Ok(mut active) = self.inner.subscriptions.lock() {
            let cancelled = active.len();
            active.drain(..).for_each(Subscription::cancel);
            tracing::info!("Cancelled {} tally subscriptions", cancelled);
        }
    }

    pub fn state(&self) -> VoterState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(VoterState::NotVoted)
    }

    pub fn has_voted(&self) -> bool {
        self.inner.cache.has_voted()
    }

    pub fn voted_candidate(&self) -> Option<CandidateId> {
        self.inner.cache.voted_candidate()
    }

    pub fn device_id(&self) -> &DeviceId {
        self.inner.device.id()
    }

    pub fn roster(&self) -> &Roster {
        &self.inner.roster
    }

    pub fn store_kind(&self) -> StoreKind {
        self.inner.store.kind()
    }

    /// Current rankings from the latest known tallies
    pub fn standings(&self) -> Standings {
        self.inner
            .board
            .lock()
            .map(|b| b.standings(&self.inner.roster))
            .unwrap_or_default()
    }

    /// Latest known tallies
    pub fn board(&self) -> TallyBoard {
        self.inner
            .board
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Whole store tree for diagnostics
    pub async fn snapshot(&self) -> Result<TallySnapshot> {
        self.inner.store.snapshot().await
    }
}
