//! Durability-preserving vbucket map repair
//!
//! Given a vbucket map and the set of nodes being failed over, compute the
//! map that results from promoting surviving replicas. When seqno stats are
//! available for chains that lost their master and still have several
//! survivors, the most up to date replica is promoted instead of the first
//! one in chain order, so that acknowledged durable writes survive.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::bucket::{Chain, VbucketId, VbucketMap};
use crate::error::MissingSeqnos;
use crate::membership::NodeId;

/// Replication progress of one vbucket copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeqnoStats {
    pub high_prepared_seqno: u64,
    pub high_seqno: u64,
}

impl SeqnoStats {
    pub fn new(high_prepared_seqno: u64, high_seqno: u64) -> Self {
        Self {
            high_prepared_seqno,
            high_seqno,
        }
    }
}

/// Seqno stats per vbucket, per node
pub type VbucketSeqnos = BTreeMap<VbucketId, BTreeMap<NodeId, SeqnoStats>>;

fn survivors<'a>(chain: &'a Chain, failed: &'a BTreeSet<NodeId>) -> impl Iterator<Item = &'a NodeId> + 'a {
    chain.iter().flatten().filter(move |n| !failed.contains(*n))
}

fn pad(mut nodes: Vec<NodeId>, length: usize) -> Chain {
    let mut chain: Chain = nodes.drain(..).map(Some).collect();
    chain.resize(length.max(chain.len()), None);
    chain
}

/// Promote the first surviving member of `chain` to master. Remaining
/// survivors keep their order; failed slots become `None` at the tail.
pub fn promote_replicas(chain: &Chain, failed: &BTreeSet<NodeId>) -> Chain {
    pad(survivors(chain, failed).cloned().collect(), chain.len())
}

/// A chain needs seqno-based selection when its master is failing over and
/// more than one replica survives.
pub fn is_markable(chain: &Chain, failed: &BTreeSet<NodeId>) -> bool {
    let master_failed = matches!(chain.first(), Some(Some(master)) if failed.contains(master));
    master_failed && survivors(chain, failed).count() > 1
}

/// Surviving nodes to query for each markable vbucket
pub fn markable_vbuckets(map: &VbucketMap, failed: &BTreeSet<NodeId>) -> BTreeMap<VbucketId, Vec<NodeId>> {
    map.iter()
        .enumerate()
        .filter(|(_, chain)| is_markable(chain, failed))
        .map(|(vb, chain)| (vb, survivors(chain, failed).cloned().collect()))
        .collect()
}

/// Group markable vbuckets by the node that has to be queried for them
pub fn nodes_to_query(markable: &BTreeMap<VbucketId, Vec<NodeId>>) -> BTreeMap<NodeId, Vec<VbucketId>> {
    let mut by_node: BTreeMap<NodeId, Vec<VbucketId>> = BTreeMap::new();
    for (vb, nodes) in markable {
        for node in nodes {
            by_node.entry(node.clone()).or_default().push(*vb);
        }
    }
    by_node
}

/// Promote the survivor with the greatest `(high_prepared_seqno, high_seqno)`.
/// Equal stats keep chain order.
///
/// Every survivor must have stats; the first one without is returned as
/// the error.
pub fn promote_most_recent(
    chain: &Chain,
    failed: &BTreeSet<NodeId>,
    stats: &BTreeMap<NodeId, SeqnoStats>,
) -> Result<Chain, NodeId> {
    let mut nodes: Vec<NodeId> = survivors(chain, failed).cloned().collect();

    let mut best: Option<(usize, SeqnoStats)> = None;
    for (i, node) in nodes.iter().enumerate() {
        let s = *stats.get(node).ok_or_else(|| node.clone())?;
        if best.map_or(true, |(_, b)| s > b) {
            best = Some((i, s));
        }
    }

    if let Some((i, _)) = best {
        let chosen = nodes.remove(i);
        nodes.insert(0, chosen);
    }
    Ok(pad(nodes, chain.len()))
}

/// Repair every chain of `map` for a failover of `failed`.
///
/// With `seqnos` present, markable chains use [`promote_most_recent`] and
/// a surviving copy missing from `seqnos` fails the whole repair; every
/// other chain uses [`promote_replicas`].
pub fn repair_map(
    map: &VbucketMap,
    failed: &BTreeSet<NodeId>,
    seqnos: Option<&VbucketSeqnos>,
) -> Result<VbucketMap, MissingSeqnos> {
    let empty = BTreeMap::new();
    map.iter()
        .enumerate()
        .map(|(vb, chain)| match seqnos {
            Some(seqnos) if is_markable(chain, failed) => {
                promote_most_recent(chain, failed, seqnos.get(&vb).unwrap_or(&empty))
                    .map_err(|node| MissingSeqnos { vbucket: vb, node })
            }
            _ => Ok(promote_replicas(chain, failed)),
        })
        .collect()
}

/// Whether every chain keeps a durability majority after `failed` leave.
///
/// For a chain of length `L` the majority is `ceil(L/2)` defined, surviving
/// members. Active and replica slots count the same.
pub fn can_preserve_durability_majority(map: &VbucketMap, failed: &BTreeSet<NodeId>) -> bool {
    map.iter().all(|chain| {
        let majority = (chain.len() + 1) / 2;
        survivors(chain, failed).count() >= majority
    })
}

/// Vbuckets without a live master
pub fn lost_vbuckets(map: &VbucketMap) -> Vec<VbucketId> {
    map.iter()
        .enumerate()
        .filter(|(_, chain)| !matches!(chain.first(), Some(Some(_))))
        .map(|(vb, _)| vb)
        .collect()
}

/// Share of vbuckets lost, as a percentage rounded to one decimal
pub fn lost_percentage(lost: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (lost as f64 * 1000.0 / total as f64).round() / 10.0
}
