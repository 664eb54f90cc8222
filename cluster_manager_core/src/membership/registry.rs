//! Membership mutations as pure transaction functions
//!
//! Nothing here performs I/O. Each function inspects a snapshot taken over
//! the keys named by its `*_keys` companion and returns the writes to
//! commit, or the reason to abort. Write lists compose by concatenation as
//! long as they touch disjoint keys.

use std::collections::{BTreeMap, BTreeSet};

use super::{Membership, NodeId, RecoveryType, ServerGroup, Service};
use crate::error::MembershipError;
use crate::quorum::{Key, Snapshot, Value, Write};

pub const DEFAULT_GROUP_UUID: &str = "0";
pub const DEFAULT_GROUP_NAME: &str = "Group 1";

fn nodes_wanted(snapshot: &Snapshot) -> Result<BTreeSet<NodeId>, MembershipError> {
    Ok(snapshot
        .typed(&Key::nodes_wanted(), Value::as_nodes, "node set")?
        .cloned()
        .unwrap_or_default())
}

fn server_groups(snapshot: &Snapshot) -> Result<Vec<ServerGroup>, MembershipError> {
    Ok(snapshot
        .typed(&Key::server_groups(), Value::as_server_groups, "server groups")?
        .cloned()
        .unwrap_or_default())
}

/// Keys read by [`activate`] and [`deactivate`]
pub fn membership_change_keys() -> Vec<Key> {
    vec![Key::nodes_wanted()]
}

/// Members of `nodes` still in `nodes_wanted`; removed nodes are skipped
/// so their per-node keys are not written back
fn wanted_only<'a>(snapshot: &Snapshot, nodes: &'a [NodeId]) -> Result<Vec<&'a NodeId>, MembershipError> {
    let wanted = nodes_wanted(snapshot)?;
    let (kept, skipped): (Vec<&NodeId>, Vec<&NodeId>) = nodes.iter().partition(|node| wanted.contains(*node));
    if !skipped.is_empty() {
        tracing::warn!("Skipping membership change of removed nodes {:?}", skipped);
    }
    Ok(kept)
}

/// Mark nodes active and clear any pending recovery type
pub fn activate(snapshot: &Snapshot, nodes: &[NodeId]) -> Result<Vec<Write>, MembershipError> {
    Ok(wanted_only(snapshot, nodes)?
        .into_iter()
        .flat_map(|node| {
            [
                Write::Set(Key::node_membership(node), Membership::Active.into()),
                Write::Set(Key::node_recovery_type(node), RecoveryType::None.into()),
            ]
        })
        .collect())
}

/// Mark nodes failed over
pub fn deactivate(snapshot: &Snapshot, nodes: &[NodeId]) -> Result<Vec<Write>, MembershipError> {
    Ok(wanted_only(snapshot, nodes)?
        .into_iter()
        .map(|node| Write::Set(Key::node_membership(node), Membership::InactiveFailed.into()))
        .collect())
}

pub fn add_node_keys(node: &NodeId) -> Vec<Key> {
    vec![
        Key::nodes_wanted(),
        Key::server_groups(),
        Key::node_membership(node),
        Key::node_services(node),
    ]
}

/// Insert a node as `InactiveAdded` into `nodes_wanted` and a server group.
///
/// With no explicit group the node joins the first group, if any exists.
pub fn add_node(
    snapshot: &Snapshot,
    node: &NodeId,
    group_uuid: Option<&str>,
    services: &BTreeSet<Service>,
) -> Result<Vec<Write>, MembershipError> {
    let mut wanted = nodes_wanted(snapshot)?;
    if wanted.contains(node) {
        return Err(MembershipError::NodePresent(node.clone()));
    }

    let mut groups = server_groups(snapshot)?;
    let group = match group_uuid {
        Some(uuid) => Some(
            groups
                .iter_mut()
                .find(|g| g.uuid == uuid)
                .ok_or_else(|| MembershipError::GroupNotFound(uuid.to_string()))?,
        ),
        None => groups.first_mut(),
    };

    let mut writes = Vec::new();
    if let Some(group) = group {
        group.nodes.push(node.clone());
        writes.push(Write::Set(Key::server_groups(), Value::ServerGroups(groups)));
    }

    wanted.insert(node.clone());
    writes.push(Write::Set(Key::nodes_wanted(), Value::Nodes(wanted)));
    writes.push(Write::Set(Key::node_membership(node), Membership::InactiveAdded.into()));
    writes.push(Write::Set(Key::node_services(node), Value::Services(services.clone())));
    Ok(writes)
}

pub fn remove_nodes_keys(nodes: &[NodeId]) -> Vec<Key> {
    let mut keys = vec![Key::nodes_wanted(), Key::server_groups(), Key::buckets()];
    for node in nodes {
        keys.extend(Key::per_node_keys(node));
    }
    keys
}

/// Remove nodes from `nodes_wanted`, every server group and every bucket's
/// per-node overrides, and delete their per-node keys.
///
/// Keys owned by `local` are left in place; a node removing itself still
/// reads them until it shuts down.
pub fn remove_nodes(
    snapshot: &Snapshot,
    nodes: &[NodeId],
    local: &NodeId,
) -> Result<Vec<Write>, MembershipError> {
    let removed: BTreeSet<&NodeId> = nodes.iter().collect();
    let mut writes = Vec::new();

    let wanted = nodes_wanted(snapshot)?;
    let remaining: BTreeSet<NodeId> = wanted.iter().filter(|n| !removed.contains(n)).cloned().collect();
    if remaining.len() != wanted.len() {
        writes.push(Write::Set(Key::nodes_wanted(), Value::Nodes(remaining)));
    }

    let mut groups = server_groups(snapshot)?;
    let mut groups_changed = false;
    for group in &mut groups {
        let before = group.nodes.len();
        group.nodes.retain(|n| !removed.contains(n));
        groups_changed |= group.nodes.len() != before;
    }
    if groups_changed {
        writes.push(Write::Set(Key::server_groups(), Value::ServerGroups(groups)));
    }

    if let Some(buckets) = snapshot.typed(&Key::buckets(), Value::as_buckets, "buckets")? {
        let mut buckets = buckets.clone();
        let mut buckets_changed = false;
        for config in buckets.values_mut() {
            let before = config.node_overrides.len();
            config.node_overrides.retain(|n, _| !removed.contains(n));
            buckets_changed |= config.node_overrides.len() != before;
        }
        if buckets_changed {
            writes.push(Write::Set(Key::buckets(), Value::Buckets(buckets)));
        }
    }

    for node in nodes.iter().filter(|n| *n != local) {
        for key in Key::per_node_keys(node) {
            if snapshot.contains(&key) {
                writes.push(Write::Delete(key));
            }
        }
    }

    Ok(writes)
}

/// Choose how a failed-over node is recovered
pub fn set_recovery_type(
    snapshot: &Snapshot,
    node: &NodeId,
    recovery: RecoveryType,
) -> Result<Vec<Write>, MembershipError> {
    let membership = snapshot.typed(&Key::node_membership(node), Value::as_membership, "membership")?;
    if membership != Some(&Membership::InactiveFailed) {
        return Err(MembershipError::NotFailedOver(node.clone()));
    }
    Ok(vec![Write::Set(Key::node_recovery_type(node), recovery.into())])
}

/// Initial layout of a freshly formed cluster: every node active, all in
/// the default server group.
pub fn bootstrap(nodes: &BTreeMap<NodeId, BTreeSet<Service>>) -> Vec<Write> {
    let group = ServerGroup {
        uuid: DEFAULT_GROUP_UUID.to_string(),
        name: DEFAULT_GROUP_NAME.to_string(),
        nodes: nodes.keys().cloned().collect(),
    };

    let mut writes = vec![
        Write::Set(Key::nodes_wanted(), Value::Nodes(nodes.keys().cloned().collect())),
        Write::Set(Key::server_groups(), Value::ServerGroups(vec![group])),
    ];
    for (node, services) in nodes {
        writes.push(Write::Set(Key::node_membership(node), Membership::Active.into()));
        writes.push(Write::Set(Key::node_services(node), Value::Services(services.clone())));
    }
    writes
}
