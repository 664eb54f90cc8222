//! Per-node composition of the control plane
//!
//! A `ClusterManager` wires one node's quorum client, coordinator
//! supervisor, coordinator client and failover engine together. Nodes
//! hosted in the same process share the leader election and the singleton
//! registry through [`SharedServices`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::config::ManagerConfig;
use crate::coordinator::{CoordinatorClient, CoordinatorContext, LeaderElection, SingletonRegistry, SingletonSupervisor};
use crate::error::{FailoverResult, MembershipError, StoreResult};
use crate::failover::{Collaborators, FailoverEngine, FailoverOptions, FailoverReport};
use crate::membership::{registry, ClusterView, NodeId, RecoveryType, Service};
use crate::metrics::{MetricsCollector, MetricsSummary};
use crate::quorum::{Key, QuorumClient, QuorumStore, Txn};

/// Cluster-wide singletons shared by every node in one process
#[derive(Clone, Default)]
pub struct SharedServices {
    pub election: Arc<LeaderElection>,
    pub registry: Arc<SingletonRegistry>,
}

/// Control plane of one node
pub struct ClusterManager {
    config: ManagerConfig,
    node: NodeId,
    client: QuorumClient,
    shared: SharedServices,
    metrics: Arc<MetricsCollector>,
    coordinator: CoordinatorClient,
    failover: FailoverEngine,
    supervisor: SingletonSupervisor,
}

impl ClusterManager {
    /// Standalone node with local collaborators
    pub fn new(config: ManagerConfig, store: Arc<dyn QuorumStore>) -> Self {
        Self::with_shared(config, store, SharedServices::default(), Collaborators::local())
    }

    /// Node that shares election and registry with other nodes
    pub fn with_shared(
        config: ManagerConfig,
        store: Arc<dyn QuorumStore>,
        shared: SharedServices,
        collaborators: Collaborators,
    ) -> Self {
        let node = NodeId::from(config.node.node_id.clone());
        let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));
        let client = QuorumClient::new(store, config.store.transaction_retries).with_metrics(Arc::clone(&metrics));
        let coordinator = CoordinatorClient::new(Arc::clone(&shared.registry), &config);
        let failover = FailoverEngine::new(
            node.clone(),
            client.clone(),
            coordinator.clone(),
            collaborators,
            config.clone(),
            Arc::clone(&metrics),
        );

        Self {
            supervisor: SingletonSupervisor::new(node.clone()),
            config,
            node,
            client,
            shared,
            metrics,
            coordinator,
            failover,
        }
    }

    /// Form a new cluster out of `nodes`: all active, all voters, all in
    /// the default server group
    pub async fn bootstrap(&self, nodes: &BTreeMap<NodeId, BTreeSet<Service>>) -> StoreResult<()> {
        let voters: BTreeSet<NodeId> = nodes.keys().cloned().collect();
        self.client.store().provision(&voters, registry::bootstrap(nodes)).await?;
        tracing::info!("Bootstrapped cluster with nodes {:?}", voters);
        Ok(())
    }

    /// Join the election and start supervising the coordinator.
    ///
    /// The first node to start in a process becomes the leader.
    pub async fn start(&mut self) {
        let election = &self.shared.election;
        election.register_candidate(self.node.clone()).await;

        self.supervisor.start(CoordinatorContext {
            node: self.node.clone(),
            client: self.client.clone(),
            election: Arc::clone(election),
            registry: Arc::clone(&self.shared.registry),
            metrics: Arc::clone(&self.metrics),
            janitor_interval: self.config.janitor_interval(),
            max_recovery_attempts: self.config.coordinator.max_recovery_attempts,
        });

        if election.leader().is_none() {
            election.elect(self.node.clone());
        }
        tracing::info!("Cluster manager on {} started", self.node);
    }

    pub async fn stop(&mut self) {
        self.shared.election.withdraw(&self.node).await;
        self.supervisor.stop().await;
        tracing::info!("Cluster manager on {} stopped", self.node);
    }

    /// Fail `nodes` over and wait for the report
    pub async fn failover(&self, nodes: BTreeSet<NodeId>, options: FailoverOptions) -> FailoverResult<FailoverReport> {
        self.failover.failover(nodes, options).await
    }

    /// Choose how a failed-over node will be recovered
    pub async fn set_recovery_type(&self, node: &NodeId, recovery: RecoveryType) -> Result<(), MembershipError> {
        let keys = [Key::node_membership(node), Key::node_recovery_type(node)];
        self.client
            .transaction(&keys, None, |snapshot| match registry::set_recovery_type(snapshot, node, recovery) {
                Ok(writes) => Txn::Commit(writes, ()),
                Err(e) => Txn::Abort(e),
            })
            .await?
            .into_result()
    }

    pub async fn view(&self) -> StoreResult<ClusterView> {
        ClusterView::load(&self.client).await
    }

    pub async fn status(&self) -> ClusterStatus {
        let leader = self.shared.election.leader();
        ClusterStatus {
            node_id: self.node.clone(),
            is_leader: leader.as_ref() == Some(&self.node),
            leader,
            has_quorum: self.client.store().has_quorum().await,
            metrics: self.metrics.snapshot(),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn client(&self) -> &QuorumClient {
        &self.client
    }

    pub fn coordinator(&self) -> &CoordinatorClient {
        &self.coordinator
    }

    pub fn failover_engine(&self) -> &FailoverEngine {
        &self.failover
    }

    pub fn shared(&self) -> &SharedServices {
        &self.shared
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }
}

/// Point-in-time status of one node's control plane
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub leader: Option<NodeId>,
    pub is_leader: bool,
    pub has_quorum: bool,
    pub metrics: MetricsSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::InMemoryQuorumStore;

    fn nodes(names: &[&str]) -> BTreeMap<NodeId, BTreeSet<Service>> {
        names
            .iter()
            .map(|n| (NodeId::from(*n), [Service::Kv].into_iter().collect()))
            .collect()
    }

    #[tokio::test]
    async fn test_bootstrap_and_status() {
        let store = Arc::new(InMemoryQuorumStore::default());
        let mut config = ManagerConfig::default();
        config.node.node_id = "a".to_string();
        let mut manager = ClusterManager::new(config, store);

        manager.bootstrap(&nodes(&["a", "b"])).await.unwrap();
        let view = manager.view().await.unwrap();
        assert_eq!(view.active_nodes().len(), 2);

        manager.start().await;
        let status = manager.status().await;
        assert!(status.is_leader);
        assert!(status.has_quorum);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_recovery_type_requires_failed_over_node() {
        let store = Arc::new(InMemoryQuorumStore::default());
        let mut config = ManagerConfig::default();
        config.node.node_id = "a".to_string();
        let manager = ClusterManager::new(config, store);
        manager.bootstrap(&nodes(&["a", "b"])).await.unwrap();

        let result = manager.set_recovery_type(&NodeId::from("b"), RecoveryType::Delta).await;
        assert_eq!(result, Err(MembershipError::NotFailedOver(NodeId::from("b"))));
    }
}
