//! Bucket configuration and vbucket maps

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::membership::NodeId;

/// Ordered list of nodes hosting one vbucket: `[master, replica1, ...]`.
/// `None` marks a slot with no live copy.
pub type Chain = Vec<Option<NodeId>>;

/// One chain per vbucket, indexed by vbucket id
pub type VbucketMap = Vec<Chain>;

/// Position of a chain in a [`VbucketMap`]
pub type VbucketId = usize;

/// Storage flavour of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketType {
    /// In-memory cache without vbucket replication
    Memcached,
    /// Persistent bucket with a vbucket map
    Couchstore,
}

/// Per-bucket configuration held in the quorum store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    pub bucket_type: BucketType,
    pub num_replicas: usize,
    /// Nodes the bucket is placed on
    pub servers: Vec<NodeId>,
    /// Absent until the bucket has been rebalanced for the first time
    pub map: Option<VbucketMap>,
    /// Per-node settings overrides, removed together with the node
    #[serde(default)]
    pub node_overrides: BTreeMap<NodeId, BTreeMap<String, String>>,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>, bucket_type: BucketType, num_replicas: usize) -> Self {
        Self {
            name: name.into(),
            bucket_type,
            num_replicas,
            servers: Vec::new(),
            map: None,
            node_overrides: BTreeMap::new(),
        }
    }

    pub fn with_servers(mut self, servers: impl IntoIterator<Item = NodeId>) -> Self {
        self.servers = servers.into_iter().collect();
        self
    }

    pub fn with_map(mut self, map: VbucketMap) -> Self {
        self.map = Some(map);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.bucket_type == BucketType::Couchstore
    }

    /// Expected length of every chain: master plus replicas
    pub fn chain_length(&self) -> usize {
        1 + self.num_replicas
    }

    /// Drop `nodes` from the server list
    pub fn strip_servers(&mut self, nodes: &BTreeSet<NodeId>) {
        self.servers.retain(|n| !nodes.contains(n));
    }

    /// Vbuckets whose active copy lives on `node`
    pub fn active_vbuckets_on(&self, node: &NodeId) -> BTreeSet<VbucketId> {
        self.map
            .iter()
            .flatten()
            .enumerate()
            .filter(|(_, chain)| chain.first().and_then(Option::as_ref) == Some(node))
            .map(|(vb, _)| vb)
            .collect()
    }
}
