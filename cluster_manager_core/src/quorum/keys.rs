//! Key layout of the replicated configuration

use crate::membership::NodeId;
use serde::{Deserialize, Serialize};

const NODE_PREFIX: &str = "node/";

/// A key in the quorum store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Key(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Set of nodes that are members of the cluster
    pub fn nodes_wanted() -> Self {
        Key::new("nodes_wanted")
    }

    /// Server group (rack/zone) layout
    pub fn server_groups() -> Self {
        Key::new("server_groups")
    }

    /// All bucket configurations
    pub fn buckets() -> Self {
        Key::new("buckets")
    }

    /// The single outstanding topology operation record
    pub fn topology_operation() -> Self {
        Key::new("unfinished_topology_operation")
    }

    /// Marker of an in-progress quorum-loss failover
    pub fn failover_opaque() -> Self {
        Key::new("failover_opaque")
    }

    /// Cluster-wide lease held by the node running a failover
    pub fn failover_lease() -> Self {
        Key::new("failover_lease")
    }

    pub fn node_membership(node: &NodeId) -> Self {
        Key::new(format!("{}{}/membership", NODE_PREFIX, node))
    }

    pub fn node_services(node: &NodeId) -> Self {
        Key::new(format!("{}{}/services", NODE_PREFIX, node))
    }

    pub fn node_recovery_type(node: &NodeId) -> Self {
        Key::new(format!("{}{}/recovery_type", NODE_PREFIX, node))
    }

    pub fn node_failover_vbuckets(node: &NodeId) -> Self {
        Key::new(format!("{}{}/failover_vbuckets", NODE_PREFIX, node))
    }

    /// Every key owned by a single node
    pub fn per_node_keys(node: &NodeId) -> Vec<Key> {
        vec![
            Key::node_membership(node),
            Key::node_services(node),
            Key::node_recovery_type(node),
            Key::node_failover_vbuckets(node),
        ]
    }

    /// Node owning this key, if it is a per-node key
    pub fn owner(&self) -> Option<NodeId> {
        let rest = self.0.strip_prefix(NODE_PREFIX)?;
        let (node, _) = rest.rsplit_once('/')?;
        Some(NodeId::from(node))
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
