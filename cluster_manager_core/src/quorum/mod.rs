//! Quorum store client for the cluster manager
//!
//! The consensus store underneath is treated as an opaque replicated
//! key/value store with linearizable snapshots, compare-and-swap commits
//! over a read set, an acquirable mastership lock and a change feed. This
//! module defines that contract (`QuorumStore`), the client that runs
//! optimistic transactions on top of it (`QuorumClient`), and an in-memory
//! implementation used by tests and the single-process server.

pub mod client;
pub mod keys;
pub mod memory;
pub mod value;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{StoreError, StoreResult};
use crate::membership::NodeId;

pub use client::{Outcome, QuorumClient, Txn};
pub use keys::Key;
pub use memory::InMemoryQuorumStore;
pub use value::Value;

/// Store-wide revision at which a key was last written (0 = never)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Revision(pub u64);

/// Opaque mastership lock token
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lock(pub u64);

impl std::fmt::Display for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock-{}", self.0)
    }
}

/// A value together with the revision that wrote it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: Value,
    pub revision: Revision,
}

/// A single mutation inside a commit
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Set(Key, Value),
    Delete(Key),
}

impl Write {
    pub fn key(&self) -> &Key {
        match self {
            Write::Set(key, _) => key,
            Write::Delete(key) => key,
        }
    }
}

/// Compare-and-swap commit request
#[derive(Debug, Clone)]
pub struct Commit {
    /// Revisions observed for every key read by the transaction
    pub read_set: BTreeMap<Key, Revision>,
    pub writes: Vec<Write>,
    /// When present the commit only applies while this lock is current
    pub lock: Option<Lock>,
}

/// Change notification for a single key
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEvent {
    pub key: Key,
    /// `None` when the key was deleted
    pub value: Option<Value>,
    pub revision: Revision,
}

/// Role of a peer in the consensus membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Counts towards quorum
    Voter,
    /// Receives the log but does not vote
    Replica,
}

/// Linearizable view restricted to the keys a transaction asked for
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<Key, Option<Versioned>>,
}

impl Snapshot {
    pub fn new(entries: BTreeMap<Key, Option<Versioned>>) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries
            .get(key)
            .and_then(|entry| entry.as_ref())
            .map(|versioned| &versioned.value)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    pub fn revision(&self, key: &Key) -> Revision {
        self.entries
            .get(key)
            .and_then(|entry| entry.as_ref())
            .map(|versioned| versioned.revision)
            .unwrap_or_default()
    }

    /// Fetch a value and check its shape
    pub fn typed<'a, T>(
        &'a self,
        key: &Key,
        extract: fn(&'a Value) -> Option<&'a T>,
        expected: &'static str,
    ) -> StoreResult<Option<&'a T>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => extract(value).map(Some).ok_or_else(|| StoreError::InvalidValue {
                key: key.to_string(),
                expected,
            }),
        }
    }

    /// Revisions of every key in the snapshot, used as the commit read set
    pub fn read_set(&self) -> BTreeMap<Key, Revision> {
        self.entries
            .keys()
            .map(|key| (key.clone(), self.revision(key)))
            .collect()
    }
}

/// Contract of the consensus-backed configuration store
#[async_trait::async_trait]
pub trait QuorumStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &Key) -> StoreResult<Option<Versioned>>;

    /// Linearizable snapshot of the named keys
    async fn snapshot(&self, keys: &[Key]) -> StoreResult<Snapshot>;

    /// Apply writes iff no key in the read set changed; `StoreError::Conflict` otherwise
    async fn commit(&self, commit: Commit) -> StoreResult<Revision>;

    /// Acquire the mastership lock, invalidating any previous holder
    async fn acquire_lock(&self) -> StoreResult<Lock>;

    /// Change feed for all keys
    fn subscribe(&self) -> broadcast::Receiver<KeyEvent>;

    /// Whether a majority of voting peers is reachable
    async fn has_quorum(&self) -> bool;

    /// Current consensus membership
    async fn peers(&self) -> BTreeMap<NodeId, PeerRole>;

    /// Add a non-voting peer
    async fn add_replica(&self, lock: Lock, node: &NodeId) -> StoreResult<()>;

    /// Remove a peer from the consensus membership
    async fn remove_peer(&self, lock: Lock, node: &NodeId) -> StoreResult<()>;

    /// Change the roles of existing peers
    async fn set_peer_roles(&self, lock: Lock, roles: &[(NodeId, PeerRole)]) -> StoreResult<()>;

    /// Quorum-loss reconfiguration: shrink the membership to `keep` without
    /// a majority of the old configuration and apply `writes` with it.
    /// Fails with `StoreError::Conflict` if any key in `read_set` changed.
    async fn failover(
        &self,
        keep: &BTreeSet<NodeId>,
        read_set: BTreeMap<Key, Revision>,
        writes: Vec<Write>,
    ) -> StoreResult<()>;

    /// Form a new cluster with `voters` and apply `writes` as its first
    /// revision. Fails if the store already has peers.
    async fn provision(&self, voters: &BTreeSet<NodeId>, writes: Vec<Write>) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Membership;

    #[test]
    fn test_snapshot_revisions_and_typed_access() {
        let mut entries = BTreeMap::new();
        let key = Key::node_membership(&NodeId::from("a"));
        entries.insert(
            key.clone(),
            Some(Versioned {
                value: Value::Membership(Membership::Active),
                revision: Revision(7),
            }),
        );
        entries.insert(Key::nodes_wanted(), None);
        let snapshot = Snapshot::new(entries);

        assert_eq!(snapshot.revision(&key), Revision(7));
        assert_eq!(snapshot.revision(&Key::nodes_wanted()), Revision(0));
        assert_eq!(
            snapshot.typed(&key, Value::as_membership, "membership").unwrap(),
            Some(&Membership::Active)
        );
        assert!(snapshot.typed(&key, Value::as_nodes, "node set").is_err());
        assert_eq!(snapshot.read_set().len(), 2);
    }
}
