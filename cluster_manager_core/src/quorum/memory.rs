//! In-memory quorum store
//!
//! Single-process stand-in for the consensus store. It keeps revisions per
//! key, validates read sets and the mastership lock on every commit, tracks
//! the consensus peer set and offers fault injection hooks for tests.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::{broadcast, RwLock};

use super::{Commit, Key, KeyEvent, Lock, PeerRole, QuorumStore, Revision, Snapshot, Value, Versioned, Write};
use crate::error::{StoreError, StoreResult};
use crate::membership::NodeId;

#[derive(Debug, Default)]
struct StoreState {
    data: BTreeMap<Key, Versioned>,
    revision: Revision,
    current_lock: Option<Lock>,
    next_lock: u64,
    peers: BTreeMap<NodeId, PeerRole>,
    quorum_lost: bool,
    fail_lock_acquisition: bool,
    failing_topology_calls: u32,
    injected_conflicts: u32,
}

impl StoreState {
    fn apply(&mut self, writes: Vec<Write>) -> Vec<KeyEvent> {
        self.revision = Revision(self.revision.0 + 1);
        let revision = self.revision;

        writes
            .into_iter()
            .map(|write| match write {
                Write::Set(key, value) => {
                    self.data.insert(
                        key.clone(),
                        Versioned {
                            value: value.clone(),
                            revision,
                        },
                    );
                    KeyEvent {
                        key,
                        value: Some(value),
                        revision,
                    }
                }
                Write::Delete(key) => {
                    self.data.remove(&key);
                    KeyEvent {
                        key,
                        value: None,
                        revision,
                    }
                }
            })
            .collect()
    }

    /// Whether any key changed since `read_set` was taken
    fn is_stale(&self, read_set: &BTreeMap<Key, Revision>) -> bool {
        read_set.iter().any(|(key, revision)| {
            let current = self.data.get(key).map(|v| v.revision).unwrap_or_default();
            current != *revision
        })
    }

    fn has_quorum(&self) -> bool {
        !self.quorum_lost && self.peers.values().any(|role| *role == PeerRole::Voter)
    }

    fn check_lock(&self, lock: Lock) -> StoreResult<()> {
        if !self.has_quorum() {
            return Err(StoreError::NoQuorum);
        }
        if self.current_lock != Some(lock) {
            return Err(StoreError::LockMismatch);
        }
        Ok(())
    }

    fn check_topology_call(&mut self, lock: Lock) -> StoreResult<()> {
        self.check_lock(lock)?;
        if self.failing_topology_calls > 0 {
            self.failing_topology_calls -= 1;
            return Err(StoreError::TopologyCall("injected failure".to_string()));
        }
        Ok(())
    }
}

/// Consensus store kept in process memory
#[derive(Debug)]
pub struct InMemoryQuorumStore {
    state: RwLock<StoreState>,
    events: broadcast::Sender<KeyEvent>,
}

impl InMemoryQuorumStore {
    /// Create an empty store whose change feed buffers `event_buffer` events
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            state: RwLock::new(StoreState::default()),
            events,
        }
    }

    /// Register the initial voting peers
    pub async fn seed_voters(&self, nodes: impl IntoIterator<Item = NodeId>) {
        let mut state = self.state.write().await;
        for node in nodes {
            state.peers.insert(node, PeerRole::Voter);
        }
    }

    /// Simulate losing (or regaining) a majority of voters
    pub async fn set_quorum_lost(&self, lost: bool) {
        self.state.write().await.quorum_lost = lost;
    }

    /// Make every lock acquisition fail until cleared
    pub async fn fail_lock_acquisition(&self, fail: bool) {
        self.state.write().await.fail_lock_acquisition = fail;
    }

    /// Fail the next `count` consensus membership calls
    pub async fn fail_next_topology_calls(&self, count: u32) {
        self.state.write().await.failing_topology_calls = count;
    }

    /// Report a conflict for the next `count` commits
    pub async fn inject_conflicts(&self, count: u32) {
        self.state.write().await.injected_conflicts = count;
    }

    /// Write a value bypassing locks and read sets
    pub async fn force_set(&self, key: Key, value: Value) {
        self.apply_unchecked(vec![Write::Set(key, value)]).await;
    }

    /// Delete a value bypassing locks and read sets
    pub async fn force_delete(&self, key: Key) {
        self.apply_unchecked(vec![Write::Delete(key)]).await;
    }

    pub async fn current_revision(&self) -> Revision {
        self.state.read().await.revision
    }

    async fn apply_unchecked(&self, writes: Vec<Write>) {
        let events = self.state.write().await.apply(writes);
        self.publish(events);
    }

    fn publish(&self, events: Vec<KeyEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }
}

impl Default for InMemoryQuorumStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait::async_trait]
impl QuorumStore for InMemoryQuorumStore {
    async fn get(&self, key: &Key) -> StoreResult<Option<Versioned>> {
        Ok(self.state.read().await.data.get(key).cloned())
    }

    async fn snapshot(&self, keys: &[Key]) -> StoreResult<Snapshot> {
        let state = self.state.read().await;
        let entries = keys
            .iter()
            .map(|key| (key.clone(), state.data.get(key).cloned()))
            .collect();
        Ok(Snapshot::new(entries))
    }

    async fn commit(&self, commit: Commit) -> StoreResult<Revision> {
        let events = {
            let mut state = self.state.write().await;

            if let Some(lock) = commit.lock {
                state.check_lock(lock)?;
            } else if !state.has_quorum() {
                return Err(StoreError::NoQuorum);
            }

            if state.injected_conflicts > 0 {
                state.injected_conflicts -= 1;
                return Err(StoreError::Conflict);
            }

            if state.is_stale(&commit.read_set) {
                return Err(StoreError::Conflict);
            }

            state.apply(commit.writes)
        };

        let revision = events.first().map(|e| e.revision).unwrap_or_default();
        self.publish(events);
        Ok(revision)
    }

    async fn acquire_lock(&self) -> StoreResult<Lock> {
        let mut state = self.state.write().await;
        if !state.has_quorum() {
            return Err(StoreError::NoQuorum);
        }
        if state.fail_lock_acquisition {
            return Err(StoreError::LockUnavailable("injected failure".to_string()));
        }
        state.next_lock += 1;
        let lock = Lock(state.next_lock);
        state.current_lock = Some(lock);
        Ok(lock)
    }

    fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    async fn has_quorum(&self) -> bool {
        self.state.read().await.has_quorum()
    }

    async fn peers(&self) -> BTreeMap<NodeId, PeerRole> {
        self.state.read().await.peers.clone()
    }

    async fn add_replica(&self, lock: Lock, node: &NodeId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.check_topology_call(lock)?;
        state.peers.entry(node.clone()).or_insert(PeerRole::Replica);
        Ok(())
    }

    async fn remove_peer(&self, lock: Lock, node: &NodeId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.check_topology_call(lock)?;
        state.peers.remove(node);
        Ok(())
    }

    async fn set_peer_roles(&self, lock: Lock, roles: &[(NodeId, PeerRole)]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.check_topology_call(lock)?;
        for (node, role) in roles {
            if let Some(current) = state.peers.get_mut(node) {
                *current = *role;
            }
        }
        Ok(())
    }

    async fn failover(
        &self,
        keep: &BTreeSet<NodeId>,
        read_set: BTreeMap<Key, Revision>,
        writes: Vec<Write>,
    ) -> StoreResult<()> {
        let events = {
            let mut state = self.state.write().await;
            if state.is_stale(&read_set) {
                return Err(StoreError::Conflict);
            }

            let voters_left = state
                .peers
                .iter()
                .any(|(node, role)| *role == PeerRole::Voter && keep.contains(node));
            if !voters_left {
                return Err(StoreError::TopologyCall("no voters would remain".to_string()));
            }

            state.peers.retain(|node, _| keep.contains(node));
            state.quorum_lost = false;
            // The old configuration's lock holder loses its mastership
            state.current_lock = None;
            state.apply(writes)
        };

        self.publish(events);
        Ok(())
    }

    async fn provision(&self, voters: &BTreeSet<NodeId>, writes: Vec<Write>) -> StoreResult<()> {
        let events = {
            let mut state = self.state.write().await;
            if !state.peers.is_empty() {
                return Err(StoreError::TopologyCall("store already provisioned".to_string()));
            }
            if voters.is_empty() {
                return Err(StoreError::TopologyCall("no voters given".to_string()));
            }
            for node in voters {
                state.peers.insert(node.clone(), PeerRole::Voter);
            }
            state.apply(writes)
        };

        self.publish(events);
        Ok(())
    }
}
