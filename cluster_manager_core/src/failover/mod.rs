//! Failover engine
//!
//! A failover removes a set of nodes from service: their vbuckets are
//! handed to surviving replicas, non-KV services are failed over one by one
//! and finally the nodes are marked `InactiveFailed`. When quorum is lost
//! the voting set is shrunk first and the failover is finished through the
//! coordinator with the same reference.

pub mod collaborators;
pub mod engine;
pub mod lease;
mod orchestrate;
pub mod vbuckets;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::bucket::VbucketId;
use crate::error::{FailoverError, FailoverResult};
use crate::membership::{ClusterView, Membership, NodeId, Service};

pub use collaborators::{
    AuditEvent, AuditSink, BucketJanitor, CleanupOutcome, Collaborators, ConfigSync, SeqnoQuery,
    ServiceFailoverRpc, VbucketStateRpc,
};
pub use engine::{FailoverEngine, FailoverHandle};

/// Caller-supplied failover flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverOptions {
    /// Allow failing over inactive nodes and going through the quorum-loss path
    pub allow_unsafe: bool,
    /// Set by auto-failover; nodes whose services could not be failed over are kept
    pub auto: bool,
    /// Reference of the quorum-loss failover this run belongs to
    pub failover_ref: Option<String>,
}

impl FailoverOptions {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn unsafe_failover() -> Self {
        Self {
            allow_unsafe: true,
            ..Self::default()
        }
    }

    pub fn auto() -> Self {
        Self {
            auto: true,
            ..Self::default()
        }
    }
}

/// Janitor result for one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BucketStatus {
    Ok,
    JanitorFailed { bad_nodes: Vec<NodeId> },
}

/// What happened to one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketOutcome {
    pub status: BucketStatus,
    /// Vbuckets left without a live copy
    pub lost_vbuckets: Vec<VbucketId>,
}

impl BucketOutcome {
    pub fn ok() -> Self {
        Self {
            status: BucketStatus::Ok,
            lost_vbuckets: Vec::new(),
        }
    }
}

/// A per-node service failover error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceFailure {
    pub service: Service,
    pub node: NodeId,
    pub reason: String,
}

/// Result of a completed failover
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverReport {
    pub nodes: BTreeSet<NodeId>,
    pub failover_ref: Option<String>,
    pub buckets: BTreeMap<String, BucketOutcome>,
    pub service_errors: Vec<ServiceFailure>,
    /// Nodes left active because their services could not be failed over
    pub unsafe_nodes: BTreeSet<NodeId>,
    pub deactivated: BTreeSet<NodeId>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl FailoverReport {
    pub fn new(nodes: &BTreeSet<NodeId>, failover_ref: Option<String>) -> Self {
        Self {
            nodes: nodes.clone(),
            failover_ref,
            buckets: BTreeMap::new(),
            service_errors: Vec::new(),
            unsafe_nodes: BTreeSet::new(),
            deactivated: BTreeSet::new(),
            started_at: chrono::Utc::now(),
            finished_at: None,
        }
    }

    /// Buckets whose janitor cleanup failed
    pub fn janitor_failures(&self) -> Vec<&str> {
        self.buckets
            .iter()
            .filter(|(_, outcome)| matches!(outcome.status, BucketStatus::JanitorFailed { .. }))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Check whether `nodes` can be failed over given `view`
pub fn is_possible(view: &ClusterView, nodes: &BTreeSet<NodeId>, options: &FailoverOptions) -> FailoverResult<()> {
    if nodes.is_empty() {
        return Err(FailoverError::NoNodes);
    }

    let remaining_kv = view.active_service_nodes(Service::Kv);
    if remaining_kv.difference(nodes).next().is_none() {
        return Err(FailoverError::LastNode);
    }

    if let Some(node) = nodes.iter().find(|node| !view.is_wanted(node)) {
        return Err(FailoverError::UnknownNode(node.clone()));
    }

    if !options.allow_unsafe {
        if let Some(node) = nodes.iter().find(|node| view.membership_of(node) != Membership::Active) {
            return Err(FailoverError::InactiveNode(node.clone()));
        }
    }

    Ok(())
}
