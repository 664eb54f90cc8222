//! Topology operations and the records that serialize them

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::MembershipError;
use crate::membership::{registry, NodeId, Service};
use crate::quorum::{Key, Lock, Snapshot, Write};

/// A topology mutation run through the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Add a node to the cluster and to the consensus membership as a replica
    AddReplica {
        node: NodeId,
        group: Option<String>,
        services: BTreeSet<Service>,
    },
    /// Remove a node from the cluster and from the consensus membership
    RemovePeer { node: NodeId },
    /// Mark nodes active and promote them to voters
    ActivateNodes { nodes: Vec<NodeId> },
    /// Mark nodes failed over and demote them to replicas
    DeactivateNodes { nodes: Vec<NodeId> },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::AddReplica { .. } => "add_replica",
            Operation::RemovePeer { .. } => "remove_peer",
            Operation::ActivateNodes { .. } => "activate_nodes",
            Operation::DeactivateNodes { .. } => "deactivate_nodes",
        }
    }

    /// Nodes the operation touches
    pub fn nodes(&self) -> Vec<NodeId> {
        match self {
            Operation::AddReplica { node, .. } | Operation::RemovePeer { node } => vec![node.clone()],
            Operation::ActivateNodes { nodes } | Operation::DeactivateNodes { nodes } => nodes.clone(),
        }
    }

    /// Operation that brings the cluster to a consistent state after this
    /// one was interrupted. An interrupted add is undone; everything else
    /// is idempotent and simply runs again.
    pub fn recovery(&self) -> Operation {
        match self {
            Operation::AddReplica { node, .. } => Operation::RemovePeer { node: node.clone() },
            other => other.clone(),
        }
    }

    /// Whether the coordinator on `local` has to hand this operation off
    /// to the next leader instead of finishing it itself
    pub fn is_delegatable(&self, local: &NodeId) -> bool {
        matches!(self, Operation::RemovePeer { node } if node == local)
    }

    /// Keys read by [`Operation::membership_writes`]
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Operation::AddReplica { node, .. } => registry::add_node_keys(node),
            Operation::RemovePeer { node } => registry::remove_nodes_keys(std::slice::from_ref(node)),
            Operation::ActivateNodes { .. } | Operation::DeactivateNodes { .. } => registry::membership_change_keys(),
        }
    }

    /// Registry-level writes of the operation
    pub fn membership_writes(&self, snapshot: &Snapshot, local: &NodeId) -> Result<Vec<Write>, MembershipError> {
        match self {
            Operation::AddReplica { node, group, services } => {
                registry::add_node(snapshot, node, group.as_deref(), services)
            }
            Operation::RemovePeer { node } => registry::remove_nodes(snapshot, std::slice::from_ref(node), local),
            Operation::ActivateNodes { nodes } => registry::activate(snapshot, nodes),
            Operation::DeactivateNodes { nodes } => registry::deactivate(snapshot, nodes),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes: Vec<&str> = match self {
            Operation::AddReplica { node, .. } | Operation::RemovePeer { node } => vec![node.as_str()],
            Operation::ActivateNodes { nodes } | Operation::DeactivateNodes { nodes } => {
                nodes.iter().map(NodeId::as_str).collect()
            }
        };
        write!(f, "{}({})", self.name(), nodes.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Owned by the coordinator that wrote it
    Regular,
    /// Left behind on purpose for the next leader to finish
    Delegated,
}

/// The single outstanding topology operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub operation: Operation,
    /// Lock the record was written under
    pub lock: Lock,
    /// Coordinator that wrote the record
    pub coordinator: NodeId,
}

impl OperationRecord {
    pub fn regular(operation: Operation, lock: Lock, coordinator: NodeId) -> Self {
        Self {
            kind: OperationKind::Regular,
            operation,
            lock,
            coordinator,
        }
    }

    pub fn delegated(self) -> Self {
        Self {
            kind: OperationKind::Delegated,
            ..self
        }
    }

    pub fn is_delegated(&self) -> bool {
        self.kind == OperationKind::Delegated
    }
}

/// Marker of an in-progress quorum-loss failover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverOpaque {
    pub reference: String,
    pub nodes: BTreeSet<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_of_add_replica_is_remove_peer() {
        let add = Operation::AddReplica {
            node: NodeId::from("d"),
            group: None,
            services: BTreeSet::new(),
        };
        assert_eq!(add.recovery(), Operation::RemovePeer { node: NodeId::from("d") });

        let activate = Operation::ActivateNodes {
            nodes: vec![NodeId::from("a")],
        };
        assert_eq!(activate.recovery(), activate);
    }

    #[test]
    fn test_only_self_removal_is_delegatable() {
        let local = NodeId::from("a");
        assert!(Operation::RemovePeer { node: local.clone() }.is_delegatable(&local));
        assert!(!Operation::RemovePeer { node: NodeId::from("b") }.is_delegatable(&local));
        assert!(!Operation::DeactivateNodes { nodes: vec![local.clone()] }.is_delegatable(&local));
    }

    #[test]
    fn test_display() {
        let op = Operation::DeactivateNodes {
            nodes: vec![NodeId::from("a"), NodeId::from("b")],
        };
        assert_eq!(op.to_string(), "deactivate_nodes(a,b)");
    }
}
