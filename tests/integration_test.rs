//! End-to-end voting workflows against a shared in-memory tally store

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally::{
    Result, VotingCoordinator,
    config::Config,
    coordinator::Reconciliation,
    local::{DeviceIdentity, FileStore, LocalElectionCache, LocalRecord, LocalStore, MemoryStore},
    renderer::{NullRenderer, Renderer},
    results::{Medal, Standings},
    store::{CountCallback, MemoryTallyStore, StoreKind, Subscription, TallyStore},
    types::{CandidateId, CastResult, DeviceId, Roster, TallySnapshot, VoteOutcome, VoterState},
};

/// Memory store that claims to outlive the process, so reconciliation runs
struct DurableStore {
    shared: Arc<MemoryTallyStore>,
    /// Delay between reading and answering a vote lookup
    lookup_delay: Duration,
}

impl DurableStore {
    fn new(shared: Arc<MemoryTallyStore>) -> Self {
        Self {
            shared,
            lookup_delay: Duration::ZERO,
        }
    }

    fn with_slow_lookup(shared: Arc<MemoryTallyStore>, lookup_delay: Duration) -> Self {
        Self { shared, lookup_delay }
    }
}

#[async_trait]
impl TallyStore for DurableStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Live
    }

    async fn probe(&self) -> Result<()> {
        self.shared.probe().await
    }

    async fn subscribe_to_candidate(
        &self,
        candidate: &CandidateId,
        on_change: CountCallback,
    ) -> Result<Subscription> {
        self.shared.subscribe_to_candidate(candidate, on_change).await
    }

    async fn subscribe_to_total(&self, on_change: CountCallback) -> Result<Subscription> {
        self.shared.subscribe_to_total(on_change).await
    }

    async fn read_candidate_count(&self, candidate: &CandidateId) -> Result<u64> {
        self.shared.read_candidate_count(candidate).await
    }

    async fn read_total(&self) -> Result<u64> {
        self.shared.read_total().await
    }

    async fn find_vote(&self, device: &DeviceId, roster: &Roster) -> Result<Option<CandidateId>> {
        let found = self.shared.find_vote(device, roster).await;
        tokio::time::sleep(self.lookup_delay).await;
        found
    }

    async fn try_cast_vote(&self, candidate: &CandidateId, device: &DeviceId) -> Result<CastResult> {
        self.shared.try_cast_vote(candidate, device).await
    }

    async fn snapshot(&self) -> Result<TallySnapshot> {
        self.shared.snapshot().await
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Rendered {
    Tally(String, u64),
    Total(u64),
    Result(String, VoteOutcome),
}

#[derive(Default)]
struct RecordingRenderer {
    events: Mutex<Vec<Rendered>>,
    standings: Mutex<Option<Standings>>,
}

impl RecordingRenderer {
    fn events(&self) -> Vec<Rendered> {
        self.events.lock().unwrap().clone()
    }

    fn tallies_for(&self, candidate: &str) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Rendered::Tally(id, n) if id == candidate => Some(n),
                _ => None,
            })
            .collect()
    }
}

impl Renderer for RecordingRenderer {
    fn on_tallies_changed(&self, candidate: &CandidateId, new_count: u64) {
        self.events
            .lock()
            .unwrap()
            .push(Rendered::Tally(candidate.to_string(), new_count));
    }

    fn on_total_changed(&self, new_total: u64) {
        self.events.lock().unwrap().push(Rendered::Total(new_total));
    }

    fn on_vote_result(&self, candidate: &CandidateId, outcome: VoteOutcome) {
        self.events
            .lock()
            .unwrap()
            .push(Rendered::Result(candidate.to_string(), outcome));
    }

    fn on_standings_changed(&self, standings: &Standings) {
        *self.standings.lock().unwrap() = Some(standings.clone());
    }
}

fn device(local: Arc<dyn LocalStore>, store: Arc<dyn TallyStore>, renderer: Arc<dyn Renderer>) -> VotingCoordinator {
    let identity = DeviceIdentity::get_or_create(local.as_ref());
    let cache = LocalElectionCache::open(local);
    VotingCoordinator::new(Roster::builtin(), identity, cache, store, renderer)
}

fn fresh_device(store: Arc<dyn TallyStore>) -> VotingCoordinator {
    device(Arc::new(MemoryStore::new()), store, Arc::new(NullRenderer))
}

fn pam() -> CandidateId {
    CandidateId::new("pam").unwrap()
}

async fn settle() {
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_double_voting_prevention_workflow() -> Result<()> {
    println!("🚫 Testing double voting prevention workflow...");

    let store = Arc::new(MemoryTallyStore::default());
    let coordinator = fresh_device(store.clone());

    println!("\n📱 Test 1: First vote...");
    assert_eq!(coordinator.cast_vote("pam").await?, VoteOutcome::Committed);
    assert_eq!(coordinator.state(), VoterState::Voted);
    println!("✅ Vote committed for pam");

    let before = store.snapshot().await?;

    println!("\n📱 Test 2: Second vote, same candidate...");
    assert_eq!(coordinator.cast_vote("pam").await?, VoteOutcome::AlreadyVoted);
    println!("✅ Duplicate rejected");

    println!("\n📱 Test 3: Second vote, other candidate...");
    assert_eq!(coordinator.cast_vote("nicole").await?, VoteOutcome::AlreadyVoted);
    assert_eq!(coordinator.state(), VoterState::VotingDenied);
    println!("✅ Switch rejected");

    let after = store.snapshot().await?;
    assert_eq!(before, after, "rejected casts must not touch the store");
    assert_eq!(after.total_votes, 1);
    assert_eq!(after.counted(), 1);
    println!("✅ Store unchanged by rejected casts");

    println!("🎉 Double voting prevention verified!");
    Ok(())
}

#[tokio::test]
async fn test_two_simultaneous_devices() -> Result<()> {
    println!("👥 Testing two devices voting at once...");

    let store = Arc::new(MemoryTallyStore::default());
    let before = store.read_candidate_count(&pam()).await?;

    let first = fresh_device(store.clone());
    let second = fresh_device(store.clone());
    assert_ne!(first.device_id(), second.device_id());

    let (a, b) = tokio::join!(first.cast_vote("pam"), second.cast_vote("pam"));
    assert_eq!(a?, VoteOutcome::Committed);
    assert_eq!(b?, VoteOutcome::Committed);

    assert_eq!(store.read_candidate_count(&pam()).await?, before + 2);
    let snapshot = store.snapshot().await?;
    let record = &snapshot.votes["pam"];
    assert!(record.has_voter(first.device_id().as_str()));
    assert!(record.has_voter(second.device_id().as_str()));
    assert!(record.is_consistent());
    println!("✅ Count increased by exactly 2");

    Ok(())
}

#[tokio::test]
async fn test_connectivity_loss_leaves_no_trace() -> Result<()> {
    println!("📡 Testing connectivity loss during a cast...");

    let store = Arc::new(MemoryTallyStore::default());
    let renderer = Arc::new(RecordingRenderer::default());
    let coordinator = device(Arc::new(MemoryStore::new()), store.clone(), renderer.clone());

    store.set_online(false);
    assert_eq!(coordinator.cast_vote("perez").await?, VoteOutcome::TransientFailure);
    assert!(!coordinator.has_voted());
    assert_eq!(coordinator.state(), VoterState::NotVoted);
    assert_eq!(
        renderer.events(),
        vec![Rendered::Result("perez".to_string(), VoteOutcome::TransientFailure)]
    );
    println!("✅ Failure reported, nothing recorded locally");

    store.set_online(true);
    let snapshot = store.snapshot().await?;
    assert_eq!(snapshot.total_votes, 0);
    assert_eq!(snapshot.counted(), 0);
    println!("✅ Tally unchanged");

    assert_eq!(coordinator.cast_vote("perez").await?, VoteOutcome::Committed);
    println!("✅ Retry after reconnect succeeds");

    Ok(())
}

#[tokio::test]
async fn test_vote_survives_restart() -> Result<()> {
    println!("💾 Testing vote persistence across restarts...");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tally-state.json");
    let store = Arc::new(MemoryTallyStore::default());

    let first_id = {
        let coordinator = device(Arc::new(FileStore::new(&path)), store.clone(), Arc::new(NullRenderer));
        assert_eq!(coordinator.cast_vote("nicole").await?, VoteOutcome::Committed);
        coordinator.device_id().clone()
    };
    println!("✅ First session voted");

    let restarted = device(Arc::new(FileStore::new(&path)), store.clone(), Arc::new(NullRenderer));
    assert_eq!(restarted.device_id(), &first_id);
    assert_eq!(restarted.state(), VoterState::Voted);
    assert_eq!(restarted.voted_candidate().unwrap().as_str(), "nicole");
    println!("✅ Restarted session remembers the vote");

    // Local fast path answers without the store
    store.set_online(false);
    assert_eq!(restarted.cast_vote("fabio").await?, VoteOutcome::AlreadyVoted);
    println!("✅ Fast-path reject works offline");

    Ok(())
}

#[tokio::test]
async fn test_store_duplicate_reconciles_local_record() -> Result<()> {
    println!("🔁 Testing store-side duplicate detection...");

    let store = Arc::new(MemoryTallyStore::default());
    let original = fresh_device(store.clone());
    assert_eq!(original.cast_vote("pam").await?, VoteOutcome::Committed);

    // Same device id, local record lost
    let local: Arc<dyn LocalStore> = Arc::new(MemoryStore::with_record(LocalRecord {
        device_id: Some(original.device_id().clone()),
        ..Default::default()
    }));
    let amnesiac = device(local, store.clone(), Arc::new(NullRenderer));
    assert!(!amnesiac.has_voted());

    assert_eq!(amnesiac.cast_vote("pam").await?, VoteOutcome::AlreadyVoted);
    assert!(amnesiac.has_voted());
    assert_eq!(amnesiac.voted_candidate(), Some(pam()));
    assert_eq!(store.read_candidate_count(&pam()).await?, 1);
    println!("✅ Store rejected the duplicate and the local record caught up");

    Ok(())
}

#[tokio::test]
async fn test_reconcile_adopts_remote_vote() -> Result<()> {
    println!("🔄 Testing reconciliation of a lost local record...");

    let shared = Arc::new(MemoryTallyStore::default());
    let store: Arc<dyn TallyStore> = Arc::new(DurableStore::new(shared.clone()));
    let original = fresh_device(store.clone());
    assert_eq!(original.cast_vote("pam").await?, VoteOutcome::Committed);

    let local: Arc<dyn LocalStore> = Arc::new(MemoryStore::with_record(LocalRecord {
        device_id: Some(original.device_id().clone()),
        ..Default::default()
    }));
    let restored = device(local.clone(), store, Arc::new(NullRenderer));

    assert_eq!(restored.reconcile().await?, Reconciliation::Adopted(pam()));
    assert_eq!(restored.state(), VoterState::Voted);
    assert!(local.load()?.unwrap().has_voted);

    assert_eq!(restored.reconcile().await?, Reconciliation::InSync);
    println!("✅ Remote vote adopted locally");

    Ok(())
}

#[tokio::test]
async fn test_reconcile_replaces_wrong_local_vote() -> Result<()> {
    println!("🔄 Testing reconciliation of a conflicting local record...");

    let store: Arc<dyn TallyStore> = Arc::new(DurableStore::new(Arc::new(MemoryTallyStore::default())));
    let original = fresh_device(store.clone());
    assert_eq!(original.cast_vote("pam").await?, VoteOutcome::Committed);

    let local: Arc<dyn LocalStore> = Arc::new(MemoryStore::with_record(LocalRecord {
        device_id: Some(original.device_id().clone()),
        has_voted: true,
        voted_for: Some(CandidateId::new("perez")?),
        voted_at: None,
    }));
    let confused = device(local, store, Arc::new(NullRenderer));

    assert_eq!(
        confused.reconcile().await?,
        Reconciliation::Replaced {
            local: CandidateId::new("perez")?,
            remote: pam(),
        }
    );
    assert_eq!(confused.voted_candidate(), Some(pam()));
    println!("✅ Store's vote replaced the stale local one");

    Ok(())
}

#[tokio::test]
async fn test_reconcile_clears_phantom_vote() -> Result<()> {
    println!("🔄 Testing reconciliation of a vote the store never saw...");

    let store: Arc<dyn TallyStore> = Arc::new(DurableStore::new(Arc::new(MemoryTallyStore::default())));
    let local: Arc<dyn LocalStore> = Arc::new(MemoryStore::with_record(LocalRecord {
        device_id: Some(DeviceIdentity::generate()),
        has_voted: true,
        voted_for: Some(CandidateId::new("fabio")?),
        voted_at: None,
    }));
    let coordinator = device(local, store.clone(), Arc::new(NullRenderer));
    assert_eq!(coordinator.state(), VoterState::Voted);

    assert_eq!(coordinator.reconcile().await?, Reconciliation::Cleared);
    assert_eq!(coordinator.state(), VoterState::NotVoted);
    assert!(!coordinator.has_voted());

    assert_eq!(coordinator.cast_vote("fabio").await?, VoteOutcome::Committed);
    assert_eq!(store.read_total().await?, 1);
    println!("✅ Phantom vote cleared, real vote counted");

    Ok(())
}

#[tokio::test]
async fn test_cast_during_reconciliation_counts_once() -> Result<()> {
    println!("🔀 Testing a cast that starts while reconciliation is asking the store...");

    let shared = Arc::new(MemoryTallyStore::default());
    let store: Arc<dyn TallyStore> = Arc::new(DurableStore::with_slow_lookup(
        shared.clone(),
        Duration::from_millis(100),
    ));
    let coordinator = fresh_device(store);

    let reconciling = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.reconcile().await })
    };
    // Let reconciliation read the store before the cast begins
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(coordinator.cast_vote("pam").await?, VoteOutcome::Committed);
    let reconciliation = reconciling.await.unwrap()?;
    assert_eq!(reconciliation, Reconciliation::InSync);
    assert!(coordinator.has_voted());
    assert_eq!(coordinator.state(), VoterState::Voted);
    println!("✅ Stale lookup did not erase the fresh vote");

    assert_eq!(coordinator.cast_vote("perez").await?, VoteOutcome::AlreadyVoted);
    let snapshot = shared.snapshot().await?;
    assert_eq!(snapshot.counted(), 1);
    assert_eq!(snapshot.total_votes, 1);
    println!("✅ Device counted once");

    Ok(())
}

#[tokio::test]
async fn test_reconciliation_after_queued_cast_sees_its_vote() -> Result<()> {
    let shared = Arc::new(MemoryTallyStore::default());
    let store: Arc<dyn TallyStore> = Arc::new(DurableStore::with_slow_lookup(
        shared.clone(),
        Duration::from_millis(50),
    ));
    let coordinator = fresh_device(store);

    let (cast, reconciliation) = tokio::join!(coordinator.cast_vote("nicole"), coordinator.reconcile());
    assert_eq!(cast?, VoteOutcome::Committed);
    assert_eq!(reconciliation?, Reconciliation::InSync);
    assert_eq!(coordinator.voted_candidate().unwrap().as_str(), "nicole");
    assert_eq!(shared.read_total().await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_reconcile_tolerates_unreachable_store() -> Result<()> {
    let shared = Arc::new(MemoryTallyStore::default());
    let coordinator = fresh_device(Arc::new(DurableStore::new(shared.clone())));

    shared.set_online(false);
    assert_eq!(coordinator.reconcile().await?, Reconciliation::Unreachable);
    assert_eq!(coordinator.state(), VoterState::NotVoted);

    Ok(())
}

#[tokio::test]
async fn test_live_tallies_reach_renderer() -> Result<()> {
    println!("📺 Testing live tally subscriptions...");

    let store = Arc::new(MemoryTallyStore::default());
    let renderer = Arc::new(RecordingRenderer::default());
    let watcher = device(Arc::new(MemoryStore::new()), store.clone(), renderer.clone());
    watcher.start().await?;
    settle().await;

    assert_eq!(renderer.tallies_for("pam"), vec![0]);
    assert!(renderer.events().contains(&Rendered::Total(0)));
    println!("✅ Initial values delivered");

    for _ in 0..3 {
        assert_eq!(fresh_device(store.clone()).cast_vote("pam").await?, VoteOutcome::Committed);
    }
    assert_eq!(fresh_device(store.clone()).cast_vote("perez").await?, VoteOutcome::Committed);
    settle().await;

    assert_eq!(renderer.tallies_for("pam"), vec![0, 1, 2, 3]);
    assert_eq!(renderer.tallies_for("perez"), vec![0, 1]);
    assert!(renderer.events().contains(&Rendered::Total(4)));
    println!("✅ Per-candidate updates arrive in order");

    let standings = watcher.standings();
    assert_eq!(standings.counted, 4);
    assert_eq!(standings.leader().unwrap().candidate_id, pam());
    assert_eq!(standings.rankings[0].medal, Some(Medal::Gold));
    assert_eq!(standings.rankings[0].percentage, 75.0);
    assert_eq!(renderer.standings.lock().unwrap().as_ref(), Some(&standings));
    println!("✅ Standings follow the tallies");

    watcher.shutdown();
    fresh_device(store.clone()).cast_vote("pam").await?;
    settle().await;
    assert_eq!(renderer.tallies_for("pam"), vec![0, 1, 2, 3]);
    println!("✅ Shutdown stops updates");

    Ok(())
}

#[tokio::test]
async fn test_open_from_config() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::for_testing();
    config.state_path = dir.path().join("state.json");

    let renderer = Arc::new(RecordingRenderer::default());
    let coordinator = VotingCoordinator::open(&config, renderer.clone()).await?;
    assert_eq!(coordinator.store_kind(), StoreKind::Memory);
    assert_eq!(coordinator.state(), VoterState::NotVoted);

    assert_eq!(coordinator.cast_vote("pam").await?, VoteOutcome::Committed);
    settle().await;
    assert!(renderer.events().contains(&Rendered::Result("pam".to_string(), VoteOutcome::Committed)));
    assert_eq!(coordinator.board().count(&pam()), 1);
    assert!(config.state_path.exists());

    coordinator.shutdown();
    Ok(())
}
