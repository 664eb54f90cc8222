//! Failover vbucket bookkeeping
//!
//! For every failed-over node we remember, per bucket, which vbuckets were
//! active on it at failover time. A node can be failed over several times,
//! so new results are always merged into what is stored.

use std::collections::{BTreeMap, BTreeSet};

use crate::bucket::{BucketConfig, VbucketId};
use crate::error::StoreResult;
use crate::membership::NodeId;
use crate::quorum::{Key, QuorumClient, Txn, Value, Write};

/// Bucket name to vbucket ids
pub type FailoverVbuckets = BTreeMap<String, BTreeSet<VbucketId>>;

/// Results of one failover, grouped by node
pub type NodeFailoverVbuckets = BTreeMap<NodeId, FailoverVbuckets>;

/// Set union of two records
pub fn merge(left: &FailoverVbuckets, right: &FailoverVbuckets) -> FailoverVbuckets {
    let mut merged = left.clone();
    for (bucket, vbuckets) in right {
        merged.entry(bucket.clone()).or_default().extend(vbuckets.iter().copied());
    }
    merged
}

/// Record the vbuckets `config` had active on each of `nodes`
pub fn record_bucket(results: &mut NodeFailoverVbuckets, config: &BucketConfig, nodes: &BTreeSet<NodeId>) {
    for node in nodes {
        let active = config.active_vbuckets_on(node);
        if !active.is_empty() {
            results
                .entry(node.clone())
                .or_default()
                .entry(config.name.clone())
                .or_default()
                .extend(active);
        }
    }
}

/// Merge `results` into the stored per-node records
pub async fn persist(client: &QuorumClient, results: &NodeFailoverVbuckets) -> StoreResult<()> {
    if results.is_empty() {
        return Ok(());
    }

    let keys: Vec<Key> = results.keys().map(Key::node_failover_vbuckets).collect();
    client
        .transaction(&keys, None, |snapshot| {
            let mut writes = Vec::new();
            for (node, fresh) in results {
                let key = Key::node_failover_vbuckets(node);
                let stored = match snapshot.typed(&key, Value::as_failover_vbuckets, "failover vbuckets") {
                    Ok(stored) => stored.cloned().unwrap_or_default(),
                    Err(e) => return Txn::Abort(e),
                };
                writes.push(Write::Set(key, merge(&stored, fresh).into()));
            }
            Txn::Commit(writes, ())
        })
        .await?
        .into_result()
}
