//! Shared tally store
//!
//! The store holds, for every candidate, a `{count, voters}` record under
//! `votes/{candidateId}` plus a global `totalVotes` counter. Two backends
//! implement the same capability set:
//!
//! 1. [`LiveTallyStore`]: the shared realtime database, multi-writer
//! 2. [`MemoryTallyStore`]: an in-process simulation used when the live
//!    store is unreachable; it is not a substitute for multi-client
//!    consistency
//!
//! A backend is chosen once by [`connect`] and never swapped mid-session.
//! Every mutation goes through [`TallyStore::try_cast_vote`], an optimistic
//! read-modify-write that is retried when a concurrent writer commits first.
//! There is no unconditional count write anywhere in this module.
//!
//! The per-candidate commit and the total increment are two separate
//! transactions. `totalVotes` can briefly lag the sum of counts, and if the
//! second transaction fails the total stays behind until a later vote.

pub mod live;
pub mod memory;
pub mod sse;

use crate::config::{BackendKind, StoreConfig};
use crate::types::{CandidateId, CastResult, DeviceId, Roster, TallySnapshot};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub use live::LiveTallyStore;
pub use memory::MemoryTallyStore;

/// Wire paths of the shared tree
pub mod paths {
    use crate::types::{CandidateId, DeviceId};

    pub const VOTES: &str = "votes";
    pub const TOTAL: &str = "totalVotes";

    /// `votes/{candidateId}`
    pub fn candidate(id: &CandidateId) -> String {
        format!("{VOTES}/{id}")
    }

    /// `votes/{candidateId}/count`
    pub fn candidate_count(id: &CandidateId) -> String {
        format!("{VOTES}/{id}/count")
    }

    /// `votes/{candidateId}/voters/{deviceId}`
    pub fn voter(id: &CandidateId, device: &DeviceId) -> String {
        format!("{VOTES}/{id}/voters/{device}")
    }
}

/// Callback receiving the new value of a subscribed counter
pub type CountCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Which backend is serving this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Live,
    Memory,
}

/// Handle to an active subscription
///
/// Cancelling (or dropping) the handle stops further callbacks.
#[derive(Debug)]
pub struct Subscription {
    key: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(key: String, task: JoinHandle<()>) -> Self {
        Self { key, task }
    }

    /// Store path this subscription watches
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether callbacks can still be delivered
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn cancel(self) {
        // Drop aborts the delivery task
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Capability set of a shared tally store
#[async_trait]
pub trait TallyStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Whether the store outlives this process and can be trusted over the
    /// local record during reconciliation
    fn is_authoritative(&self) -> bool {
        self.kind() == StoreKind::Live
    }

    /// Cheap connectivity check
    async fn probe(&self) -> Result<()>;

    /// Invoke `on_change` with the candidate's count now and on every change,
    /// in the order the stored value changed
    async fn subscribe_to_candidate(
        &self,
        candidate: &CandidateId,
        on_change: CountCallback,
    ) -> Result<Subscription>;

    /// Same contract as [`TallyStore::subscribe_to_candidate`] for the total
    async fn subscribe_to_total(&self, on_change: CountCallback) -> Result<Subscription>;

    /// Point-in-time read; may be stale relative to concurrent writers
    async fn read_candidate_count(&self, candidate: &CandidateId) -> Result<u64>;

    async fn read_total(&self) -> Result<u64>;

    /// Which roster candidate, if any, lists this device among its voters
    async fn find_vote(&self, device: &DeviceId, roster: &Roster) -> Result<Option<CandidateId>>;

    /// Atomically add `device` to the candidate's voters and bump its count,
    /// then increment the total
    ///
    /// Aborts without mutation when the device is already a voter. Fails
    /// with `Unavailable` on connectivity loss and `ConflictExhausted` when
    /// concurrent writers win every attempt.
    async fn try_cast_vote(&self, candidate: &CandidateId, device: &DeviceId) -> Result<CastResult>;

    /// Whole tree in wire shape, for diagnostics
    async fn snapshot(&self) -> Result<TallySnapshot>;
}

/// Select and initialize the backend for this session
///
/// `Auto` probes the live store within the configured timeout and falls back
/// to the in-memory simulation; `Live` treats an unreachable store as fatal.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn TallyStore>> {
    let memory = || -> Arc<dyn TallyStore> {
        Arc::new(MemoryTallyStore::new(config.max_transaction_retries))
    };

    match config.backend {
        BackendKind::Memory => {
            tracing::info!("Using in-memory tally store");
            Ok(memory())
        }
        BackendKind::Live => {
            let live = open_live(config).await?;
            Ok(live)
        }
        BackendKind::Auto => {
            if config.database_url.is_none() {
                tracing::warn!("No database URL configured, using in-memory tally store");
                return Ok(memory());
            }

            match open_live(config).await {
                Ok(live) => Ok(live),
                Err(e) => {
                    tracing::warn!("Live tally store unreachable, using in-memory store: {}", e);
                    Ok(memory())
                }
            }
        }
    }
}

async fn open_live(config: &StoreConfig) -> Result<Arc<dyn TallyStore>> {
    let live = LiveTallyStore::new(config)?;

    tokio::time::timeout(config.connect_timeout(), live.probe())
        .await
        .map_err(|_| crate::store_error!("Connection timeout after {}ms", config.connect_timeout_ms))??;

    tracing::info!("Connected to live tally store at {}", live.base_url());
    Ok(Arc::new(live))
}
