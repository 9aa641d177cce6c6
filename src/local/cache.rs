//! Local election cache: "have I voted, and for whom"
//!
//! Fast-path check before touching the shared store and fallback record when
//! the store is unreachable. Written only after the store confirms a vote
//! (or the store reports the device already voted).

use super::{LocalRecord, LocalStore};
use crate::types::CandidateId;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct LocalElectionCache {
    store: Arc<dyn LocalStore>,
    record: Mutex<LocalRecord>,
    durable: AtomicBool,
}

impl LocalElectionCache {
    /// Open the cache, starting empty if storage is unreadable
    pub fn open(store: Arc<dyn LocalStore>) -> Self {
        let (record, durable) = match store.load() {
            Ok(record) => (record.unwrap_or_default(), true),
            Err(e) => {
                tracing::warn!("Local election record unreadable, starting empty: {}", e);
                (LocalRecord::default(), false)
            }
        };

        Self {
            store,
            record: Mutex::new(record),
            durable: AtomicBool::new(durable),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LocalRecord>> {
        self.record
            .lock()
            .map_err(|_| Error::internal("Local election cache lock poisoned"))
    }

    pub fn has_voted(&self) -> bool {
        self.lock().map(|r| r.has_voted).unwrap_or(false)
    }

    pub fn voted_candidate(&self) -> Option<CandidateId> {
        self.lock().ok().and_then(|r| r.voted_for.clone())
    }

    /// Whether the last write reached durable storage
    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::SeqCst)
    }

    /// Record a confirmed vote
    ///
    /// Recording the same candidate again is a no-op. Recording a different
    /// candidate over an existing record fails with
    /// [`Error::InconsistentLocalState`] and leaves the record untouched.
    /// A failed durable write keeps the vote in memory for this session.
    pub fn record_vote(&self, candidate: &CandidateId) -> Result<()> {
        let mut record = self.lock()?;

        // A record that says voted without a candidate is completed below
        if let Some(existing) = record.voted_for.as_ref().filter(|_| record.has_voted) {
            if existing != candidate {
                return Err(Error::inconsistent(existing.as_str(), candidate.as_str()));
            }
            return Ok(());
        }

        record.has_voted = true;
        record.voted_for = Some(candidate.clone());
        record.voted_at = Some(Utc::now());
        self.persist(&record);
        Ok(())
    }

    /// Forget the vote, keeping the device id
    pub fn clear(&self) -> Result<()> {
        let mut record = self.lock()?;
        record.has_voted = false;
        record.voted_for = None;
        record.voted_at = None;
        self.persist(&record);
        Ok(())
    }

    fn persist(&self, record: &LocalRecord) {
        // Keep whatever device id storage holds; identity owns that field
        let result = self.store.update(&mut |stored| {
            stored.has_voted = record.has_voted;
            stored.voted_for = record.voted_for.clone();
            stored.voted_at = record.voted_at;
        });

        let ok = match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Local election record not persisted: {}", e);
                false
            }
        };

        self.durable.store(ok, Ordering::SeqCst);
    }
}
