//! Services the failover engine talks to
//!
//! Each collaborator is a narrow async trait. The `Local*` implementations
//! serve a single-process deployment where every node's data lives in the
//! quorum store and there is no remote peer to call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::bucket::{BucketConfig, VbucketId};
use crate::map_repair::VbucketSeqnos;
use crate::membership::{ClusterView, NodeId, Service};

/// Pulls the latest configuration from peers before a failover
#[async_trait::async_trait]
pub trait ConfigSync: Send + Sync {
    async fn pull(&self, peers: &BTreeSet<NodeId>) -> Result<(), String>;
}

/// Result of a bucket janitor cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Ok,
    /// Cleanup failed on these nodes
    BadNodes(Vec<NodeId>),
    Failed(String),
}

/// Bucket-level checks and cleanup around a failover
#[async_trait::async_trait]
pub trait BucketJanitor: Send + Sync {
    /// Check that the bucket's server list agrees with the membership
    async fn check_server_list(&self, bucket: &BucketConfig, view: &ClusterView) -> Result<(), String>;

    /// Activate surviving vbuckets and fix replications after the map changed
    async fn cleanup(&self, bucket: &BucketConfig, failed: &BTreeSet<NodeId>) -> CleanupOutcome;
}

/// Answer of a batched seqno query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeqnoQuery {
    pub stats: VbucketSeqnos,
    /// Nodes that did not answer
    pub failed_nodes: Vec<NodeId>,
}

/// Per-node vbucket state queries
#[async_trait::async_trait]
pub trait VbucketStateRpc: Send + Sync {
    /// Fetch `high_prepared_seqno`/`high_seqno` for the listed vbuckets on
    /// every listed node in one round trip. Copies with no stats are left
    /// out of `stats`.
    async fn query_seqnos(&self, bucket: &str, requests: &BTreeMap<NodeId, Vec<VbucketId>>) -> SeqnoQuery;
}

/// Per-service failover calls
#[async_trait::async_trait]
pub trait ServiceFailoverRpc: Send + Sync {
    /// Fail `nodes` over for `service`, reporting a status per node
    async fn complete_service_failover(
        &self,
        service: Service,
        nodes: &BTreeSet<NodeId>,
    ) -> BTreeMap<NodeId, Result<(), String>>;
}

/// Operator-facing notifications
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    FailoverStarted {
        nodes: BTreeSet<NodeId>,
    },
    FailoverEnded {
        nodes: BTreeSet<NodeId>,
        success: bool,
        code: Option<&'static str>,
    },
    DataLost {
        bucket: String,
        vbuckets: Vec<VbucketId>,
        percentage: f64,
    },
}

/// Fire-and-forget sink for audit events
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Collaborators used by one failover engine
#[derive(Clone)]
pub struct Collaborators {
    pub config_sync: Arc<dyn ConfigSync>,
    pub bucket_janitor: Arc<dyn BucketJanitor>,
    pub vbucket_state: Arc<dyn VbucketStateRpc>,
    pub service_failover: Arc<dyn ServiceFailoverRpc>,
    pub audit: Arc<dyn AuditSink>,
}

impl Collaborators {
    /// Collaborators for a single-process deployment
    pub fn local() -> Self {
        Self {
            config_sync: Arc::new(LocalConfigSync),
            bucket_janitor: Arc::new(LocalBucketJanitor),
            vbucket_state: Arc::new(StaticVbucketState::default()),
            service_failover: Arc::new(LocalServiceFailover),
            audit: Arc::new(LogAuditSink),
        }
    }
}

/// Nothing to pull when all configuration lives in one store
pub struct LocalConfigSync;

#[async_trait::async_trait]
impl ConfigSync for LocalConfigSync {
    async fn pull(&self, peers: &BTreeSet<NodeId>) -> Result<(), String> {
        tracing::debug!("Config already in sync with {} peer(s)", peers.len());
        Ok(())
    }
}

/// Checks server lists against the membership; cleanup always succeeds
pub struct LocalBucketJanitor;

#[async_trait::async_trait]
impl BucketJanitor for LocalBucketJanitor {
    async fn check_server_list(&self, bucket: &BucketConfig, view: &ClusterView) -> Result<(), String> {
        match bucket.servers.iter().find(|node| !view.is_wanted(node)) {
            Some(node) => Err(format!("server {} of bucket {} is not a cluster member", node, bucket.name)),
            None => Ok(()),
        }
    }

    async fn cleanup(&self, bucket: &BucketConfig, _failed: &BTreeSet<NodeId>) -> CleanupOutcome {
        tracing::debug!("Janitor cleanup of bucket {} done", bucket.name);
        CleanupOutcome::Ok
    }
}

/// Serves seqno stats from a fixed table; copies missing from it are left
/// out of the answer
#[derive(Debug, Default)]
pub struct StaticVbucketState {
    stats: BTreeMap<String, VbucketSeqnos>,
}

impl StaticVbucketState {
    pub fn new(stats: BTreeMap<String, VbucketSeqnos>) -> Self {
        Self { stats }
    }
}

#[async_trait::async_trait]
impl VbucketStateRpc for StaticVbucketState {
    async fn query_seqnos(&self, bucket: &str, requests: &BTreeMap<NodeId, Vec<VbucketId>>) -> SeqnoQuery {
        let known = self.stats.get(bucket);
        let mut stats = VbucketSeqnos::new();
        for (node, vbuckets) in requests {
            for vb in vbuckets {
                if let Some(s) = known.and_then(|k| k.get(vb)).and_then(|per_node| per_node.get(node)) {
                    stats.entry(*vb).or_default().insert(node.clone(), *s);
                }
            }
        }
        SeqnoQuery {
            stats,
            failed_nodes: Vec::new(),
        }
    }
}

/// Reports every service failover as successful
pub struct LocalServiceFailover;

#[async_trait::async_trait]
impl ServiceFailoverRpc for LocalServiceFailover {
    async fn complete_service_failover(
        &self,
        service: Service,
        nodes: &BTreeSet<NodeId>,
    ) -> BTreeMap<NodeId, Result<(), String>> {
        tracing::info!("Service {} failed over on {} node(s)", service, nodes.len());
        nodes.iter().map(|n| (n.clone(), Ok(()))).collect()
    }
}

/// Writes audit events to the log
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn emit(&self, event: AuditEvent) {
        match event {
            AuditEvent::FailoverStarted { nodes } => {
                tracing::info!(target: "audit", "Failover of {:?} started", nodes);
            }
            AuditEvent::FailoverEnded { nodes, success, code } => {
                if success {
                    tracing::info!(target: "audit", "Failover of {:?} completed", nodes);
                } else {
                    tracing::error!(target: "audit", "Failover of {:?} failed: {}", nodes, code.unwrap_or("unknown"));
                }
            }
            AuditEvent::DataLost {
                bucket,
                vbuckets,
                percentage,
            } => {
                tracing::error!(
                    target: "audit",
                    "Data lost for {}% of vbuckets in bucket {} ({} vbuckets)",
                    percentage,
                    bucket,
                    vbuckets.len()
                );
            }
        }
    }
}
