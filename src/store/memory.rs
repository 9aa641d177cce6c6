//! In-process simulation of the shared tally store
//!
//! Keeps the same wire records as the live store and runs the same
//! optimistic transaction discipline: read a versioned value, compute the
//! next value outside the lock, then compare-and-set against the version
//! read. Subscribers are fed from inside the commit critical section so
//! per-key delivery order equals commit order.

use super::{paths, CountCallback, StoreKind, Subscription, TallyStore};
use crate::types::{CandidateId, CastResult, DeviceId, Roster, TallyRecord, TallySnapshot};
use crate::{Error, Result, store_error};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
struct Versioned<T> {
    value: T,
    version: u64,
}

#[derive(Default)]
struct State {
    votes: HashMap<CandidateId, Versioned<TallyRecord>>,
    total: Versioned<u64>,
    listeners: HashMap<String, Vec<mpsc::UnboundedSender<u64>>>,
    /// Commits to reject as if another writer got there first
    #[cfg(test)]
    forced_conflicts: u32,
}

impl State {
    fn notify(&mut self, key: &str, value: u64) {
        if let Some(senders) = self.listeners.get_mut(key) {
            senders.retain(|tx| tx.send(value).is_ok());
        }
    }

    #[cfg(test)]
    fn take_forced_conflict(&mut self) -> bool {
        if self.forced_conflicts > 0 {
            self.forced_conflicts -= 1;
            true
        } else {
            false
        }
    }

    #[cfg(not(test))]
    fn take_forced_conflict(&mut self) -> bool {
        false
    }
}

/// In-memory tally store
pub struct MemoryTallyStore {
    state: Mutex<State>,
    online: AtomicBool,
    max_retries: u32,
}

impl MemoryTallyStore {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            online: AtomicBool::new(true),
            max_retries: max_retries.max(1),
        }
    }

    /// Simulate losing or regaining connectivity
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        tracing::info!("In-memory tally store {}", if online { "online" } else { "offline" });
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn force_conflicts(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.forced_conflicts = count;
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(store_error!("Tally store offline"))
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::internal("Tally store lock poisoned"))
    }

    fn subscribe(&self, key: String, current: impl Fn(&State) -> u64, on_change: CountCallback) -> Result<Subscription> {
        self.ensure_online()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock()?;
            let value = current(&state);
            // Current value goes out first, before any later commit can
            let _ = tx.send(value);
            state.listeners.entry(key.clone()).or_default().push(tx);
        }

        let task = tokio::spawn(async move {
            let mut last = None;
            while let Some(value) = rx.recv().await {
                if last != Some(value) {
                    last = Some(value);
                    on_change(value);
                }
            }
        });

        Ok(Subscription::new(key, task))
    }

    async fn commit_vote(&self, candidate: &CandidateId, device: &DeviceId) -> Result<CastResult> {
        let key = paths::candidate(candidate);

        for attempt in 1..=self.max_retries {
            self.ensure_online()?;

            let read = {
                let state = self.lock()?;
                state.votes.get(candidate).cloned().unwrap_or_default()
            };

            let Some(next) = read.value.admit(device.as_str()) else {
                return Ok(CastResult::AlreadyVoted);
            };

            // Let concurrent writers interleave as they would over the network
            tokio::task::yield_now().await;

            let mut state = self.lock()?;
            let current_version = state.votes.get(candidate).map_or(0, |v| v.version);
            if current_version != read.version || state.take_forced_conflict() {
                tracing::debug!("Conflict on {} (attempt {}), retrying", key, attempt);
                continue;
            }

            let count = next.count;
            state.votes.insert(
                candidate.clone(),
                Versioned {
                    value: next,
                    version: read.version + 1,
                },
            );
            state.notify(&paths::candidate_count(candidate), count);
            return Ok(CastResult::Committed { count });
        }

        Err(Error::ConflictExhausted {
            key,
            attempts: self.max_retries,
        })
    }

    async fn increment_total(&self) -> Result<u64> {
        for attempt in 1..=self.max_retries {
            self.ensure_online()?;

            let read = self.lock()?.total.clone();
            let next = read.value + 1;

            tokio::task::yield_now().await;

            let mut state = self.lock()?;
            if state.total.version != read.version {
                tracing::debug!("Conflict on {} (attempt {}), retrying", paths::TOTAL, attempt);
                continue;
            }

            state.total = Versioned {
                value: next,
                version: read.version + 1,
            };
            state.notify(paths::TOTAL, next);
            return Ok(next);
        }

        Err(Error::ConflictExhausted {
            key: paths::TOTAL.to_string(),
            attempts: self.max_retries,
        })
    }
}

impl Default for MemoryTallyStore {
    fn default() -> Self {
        Self::new(25)
    }
}

#[async_trait]
impl TallyStore for MemoryTallyStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    async fn probe(&self) -> Result<()> {
        self.ensure_online()
    }

    async fn subscribe_to_candidate(
        &self,
        candidate: &CandidateId,
        on_change: CountCallback,
    ) -> Result<Subscription> {
        let id = candidate.clone();
        self.subscribe(
            paths::candidate_count(candidate),
            move |state| state.votes.get(&id).map_or(0, |v| v.value.count),
            on_change,
        )
    }

    async fn subscribe_to_total(&self, on_change: CountCallback) -> Result<Subscription> {
        self.subscribe(paths::TOTAL.to_string(), |state| state.total.value, on_change)
    }

    async fn read_candidate_count(&self, candidate: &CandidateId) -> Result<u64> {
        self.ensure_online()?;
        let state = self.lock()?;
        Ok(state.votes.get(candidate).map_or(0, |v| v.value.count))
    }

    async fn read_total(&self) -> Result<u64> {
        self.ensure_online()?;
        Ok(self.lock()?.total.value)
    }

    async fn find_vote(&self, device: &DeviceId, roster: &Roster) -> Result<Option<CandidateId>> {
        self.ensure_online()?;
        let state = self.lock()?;
        Ok(roster
            .ids()
            .find(|id| {
                state
                    .votes
                    .get(*id)
                    .is_some_and(|v| v.value.has_voter(device.as_str()))
            })
            .cloned())
    }

    async fn try_cast_vote(&self, candidate: &CandidateId, device: &DeviceId) -> Result<CastResult> {
        let result = self.commit_vote(candidate, device).await?;

        if let CastResult::Committed { count } = result {
            tracing::info!(
                "Vote committed: candidate={}, device={}, count={}",
                candidate,
                device.short(),
                count
            );

            if let Err(e) = self.increment_total().await {
                tracing::warn!("Vote for {} committed but total not incremented: {}", candidate, e);
            }
        }

        Ok(result)
    }

    async fn snapshot(&self) -> Result<TallySnapshot> {
        self.ensure_online()?;
        let state = self.lock()?;
        Ok(TallySnapshot {
            votes: state
                .votes
                .iter()
                .map(|(id, v)| (id.to_string(), v.value.clone()))
                .collect(),
            total_votes: state.total.value,
        })
    }
}
