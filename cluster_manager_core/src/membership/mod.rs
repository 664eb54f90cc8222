//! Cluster membership registry
//!
//! Tracks which nodes belong to the cluster, their membership state,
//! recovery type, services and server group. Reads go through
//! [`ClusterView`]; mutations are pure transaction functions in
//! [`registry`] that the quorum client executes.

pub mod registry;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::quorum::{Key, QuorumClient, Snapshot, Value};

/// Opaque node identifier (`name@host`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Membership state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    /// Serving traffic and counted for topology decisions
    Active,
    /// Added but not yet rebalanced in
    InactiveAdded,
    /// Failed over
    InactiveFailed,
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Membership::Active => write!(f, "active"),
            Membership::InactiveAdded => write!(f, "inactiveAdded"),
            Membership::InactiveFailed => write!(f, "inactiveFailed"),
        }
    }
}

/// How a failed-over node will be brought back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecoveryType {
    #[default]
    None,
    Delta,
    Full,
}

/// Services a node can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Service {
    Kv,
    Index,
    N1ql,
    Fts,
    Eventing,
    Cbas,
    Backup,
}

impl Service {
    pub fn name(&self) -> &'static str {
        match self {
            Service::Kv => "kv",
            Service::Index => "index",
            Service::N1ql => "n1ql",
            Service::Fts => "fts",
            Service::Eventing => "eventing",
            Service::Cbas => "cbas",
            Service::Backup => "backup",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Named collection of nodes (rack/zone)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
    pub uuid: String,
    pub name: String,
    pub nodes: Vec<NodeId>,
}

/// Consistent read of the membership keys
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterView {
    pub nodes_wanted: BTreeSet<NodeId>,
    pub membership: BTreeMap<NodeId, Membership>,
    pub services: BTreeMap<NodeId, BTreeSet<Service>>,
    pub recovery: BTreeMap<NodeId, RecoveryType>,
    pub server_groups: Vec<ServerGroup>,
}

impl ClusterView {
    /// Keys needed to build a view once `nodes_wanted` is known
    pub fn keys_for(nodes: &BTreeSet<NodeId>) -> Vec<Key> {
        let mut keys = vec![Key::nodes_wanted(), Key::server_groups()];
        for node in nodes {
            keys.push(Key::node_membership(node));
            keys.push(Key::node_services(node));
            keys.push(Key::node_recovery_type(node));
        }
        keys
    }

    /// Build a view from a snapshot taken over [`ClusterView::keys_for`]
    pub fn from_snapshot(snapshot: &Snapshot) -> StoreResult<Self> {
        let nodes_wanted = snapshot
            .typed(&Key::nodes_wanted(), Value::as_nodes, "node set")?
            .cloned()
            .unwrap_or_default();
        let server_groups = snapshot
            .typed(&Key::server_groups(), Value::as_server_groups, "server groups")?
            .cloned()
            .unwrap_or_default();

        let mut view = ClusterView {
            server_groups,
            ..Default::default()
        };

        for node in &nodes_wanted {
            if let Some(m) = snapshot.typed(&Key::node_membership(node), Value::as_membership, "membership")? {
                view.membership.insert(node.clone(), *m);
            }
            if let Some(s) = snapshot.typed(&Key::node_services(node), Value::as_services, "services")? {
                view.services.insert(node.clone(), s.clone());
            }
            if let Some(r) = snapshot.typed(&Key::node_recovery_type(node), Value::as_recovery_type, "recovery type")? {
                view.recovery.insert(node.clone(), *r);
            }
        }

        view.nodes_wanted = nodes_wanted;
        Ok(view)
    }

    /// Read the current membership from the store
    pub async fn load(client: &QuorumClient) -> StoreResult<Self> {
        let nodes = match client.get(&Key::nodes_wanted()).await? {
            Some(Value::Nodes(nodes)) => nodes,
            _ => BTreeSet::new(),
        };
        let snapshot = client.snapshot(&Self::keys_for(&nodes)).await?;
        Self::from_snapshot(&snapshot)
    }

    pub fn is_wanted(&self, node: &NodeId) -> bool {
        self.nodes_wanted.contains(node)
    }

    /// Membership of a node; nodes without a record are treated as `InactiveAdded`
    pub fn membership_of(&self, node: &NodeId) -> Membership {
        self.membership.get(node).copied().unwrap_or(Membership::InactiveAdded)
    }

    pub fn recovery_type_of(&self, node: &NodeId) -> RecoveryType {
        self.recovery.get(node).copied().unwrap_or_default()
    }

    pub fn active_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes_wanted
            .iter()
            .filter(|node| self.membership_of(node) == Membership::Active)
            .cloned()
            .collect()
    }

    pub fn services_of(&self, node: &NodeId) -> BTreeSet<Service> {
        self.services.get(node).cloned().unwrap_or_default()
    }

    /// Subset of `nodes` running `service`
    pub fn service_nodes<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a NodeId>,
        service: Service,
    ) -> BTreeSet<NodeId> {
        nodes
            .into_iter()
            .filter(|node| self.services_of(node).contains(&service))
            .cloned()
            .collect()
    }

    /// Active nodes running `service`
    pub fn active_service_nodes(&self, service: Service) -> BTreeSet<NodeId> {
        let active = self.active_nodes();
        self.service_nodes(&active, service)
    }

    pub fn group_of(&self, node: &NodeId) -> Option<&ServerGroup> {
        self.server_groups.iter().find(|g| g.nodes.contains(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ClusterView {
        let mut view = ClusterView::default();
        for (name, membership, services) in [
            ("a", Membership::Active, vec![Service::Kv]),
            ("b", Membership::Active, vec![Service::Kv, Service::Index]),
            ("c", Membership::InactiveFailed, vec![Service::Kv]),
            ("d", Membership::Active, vec![Service::N1ql]),
        ] {
            let node = NodeId::from(name);
            view.nodes_wanted.insert(node.clone());
            view.membership.insert(node.clone(), membership);
            view.services.insert(node, services.into_iter().collect());
        }
        view
    }

    #[test]
    fn test_active_service_nodes() {
        let view = view();
        let kv = view.active_service_nodes(Service::Kv);
        assert_eq!(kv, [NodeId::from("a"), NodeId::from("b")].into_iter().collect());
        assert_eq!(view.active_nodes().len(), 3);
    }

    #[test]
    fn test_unknown_membership_defaults_to_inactive_added() {
        let view = view();
        assert_eq!(view.membership_of(&NodeId::from("zzz")), Membership::InactiveAdded);
        assert_eq!(view.recovery_type_of(&NodeId::from("a")), RecoveryType::None);
    }
}
