//! Shared harness for the integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cluster_manager_core::failover::Collaborators;
use cluster_manager_core::quorum::{Txn, Write};
use cluster_manager_core::{
    BucketConfig, ClusterManager, InMemoryQuorumStore, Key, ManagerConfig, NodeId, Service, SharedServices, Value,
};

pub fn node(name: &str) -> NodeId {
    NodeId::from(name)
}

pub fn node_set(names: &[&str]) -> BTreeSet<NodeId> {
    names.iter().map(|n| node(n)).collect()
}

pub fn chain(names: &[&str]) -> Vec<Option<NodeId>> {
    names
        .iter()
        .map(|n| if *n == "_" { None } else { Some(node(n)) })
        .collect()
}

/// Config tuned for fast tests
pub fn test_config(node_id: &str) -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.node.node_id = node_id.to_string();
    config.node.durability_aware = false;
    config.coordinator.retry_sleep_ms = 10;
    config.coordinator.call_timeout_secs = 5;
    config.metrics.enabled = false;
    config
}

/// Several in-process nodes sharing one store and one election
pub struct TestCluster {
    pub store: Arc<InMemoryQuorumStore>,
    pub shared: SharedServices,
    pub managers: Vec<ClusterManager>,
}

pub struct ClusterBuilder {
    store: Arc<InMemoryQuorumStore>,
    nodes: Vec<(NodeId, BTreeSet<Service>)>,
    collaborators: Collaborators,
    configure: Box<dyn Fn(&mut ManagerConfig)>,
    running: Vec<NodeId>,
}

impl ClusterBuilder {
    /// Nodes running only the kv service
    pub fn kv_nodes(names: &[&str]) -> Self {
        Self {
            store: Arc::new(InMemoryQuorumStore::new(256)),
            nodes: names
                .iter()
                .map(|n| (node(n), [Service::Kv].into_iter().collect()))
                .collect(),
            collaborators: Collaborators::local(),
            configure: Box::new(|_| {}),
            running: names.first().map(|n| vec![node(n)]).unwrap_or_default(),
        }
    }

    /// Store the cluster will run on, for collaborators that poke at it
    pub fn store(&self) -> Arc<InMemoryQuorumStore> {
        self.store.clone()
    }

    pub fn with_services(mut self, name: &str, services: &[Service]) -> Self {
        let services: BTreeSet<Service> = services.iter().copied().collect();
        match self.nodes.iter_mut().find(|(n, _)| n.as_str() == name) {
            Some(entry) => entry.1 = services,
            None => self.nodes.push((node(name), services)),
        }
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn configure(mut self, f: impl Fn(&mut ManagerConfig) + 'static) -> Self {
        self.configure = Box::new(f);
        self
    }

    /// Nodes that get a running manager, in start order; the first leads
    pub fn running(mut self, names: &[&str]) -> Self {
        self.running = names.iter().map(|n| node(n)).collect();
        self
    }

    pub async fn start(self) -> TestCluster {
        let store = self.store;
        let shared = SharedServices::default();

        let mut managers = Vec::new();
        for id in &self.running {
            let mut config = test_config(id.as_str());
            (self.configure)(&mut config);
            managers.push(ClusterManager::with_shared(
                config,
                store.clone(),
                shared.clone(),
                self.collaborators.clone(),
            ));
        }

        let layout: BTreeMap<NodeId, BTreeSet<Service>> = self.nodes.into_iter().collect();
        managers[0].bootstrap(&layout).await.unwrap();

        for manager in managers.iter_mut() {
            manager.start().await;
        }

        let cluster = TestCluster { store, shared, managers };
        let leader = cluster.managers[0].node().clone();
        let (c, l) = (&cluster, &leader);
        assert!(
            eventually(|| async move { c.leader_registered(l).await }).await,
            "coordinator never registered"
        );
        cluster
    }
}

impl TestCluster {
    pub fn leader(&self) -> &ClusterManager {
        &self.managers[0]
    }

    pub fn manager(&self, name: &str) -> &ClusterManager {
        self.managers
            .iter()
            .find(|m| m.node().as_str() == name)
            .unwrap()
    }

    pub async fn leader_registered(&self, node: &NodeId) -> bool {
        matches!(self.shared.registry.lookup().await, Some(handle) if handle.node() == node)
    }

    pub async fn put_buckets(&self, buckets: Vec<BucketConfig>) {
        let key = Key::buckets();
        let buckets: BTreeMap<String, BucketConfig> = buckets.into_iter().map(|b| (b.name.clone(), b)).collect();
        self.leader()
            .client()
            .transaction(&[key.clone()], None, |_| {
                Txn::<(), ()>::Commit(vec![Write::Set(key.clone(), Value::Buckets(buckets.clone()))], ())
            })
            .await
            .unwrap();
    }

    pub async fn bucket(&self, name: &str) -> BucketConfig {
        match self.leader().client().get(&Key::buckets()).await.unwrap() {
            Some(Value::Buckets(buckets)) => buckets[name].clone(),
            other => panic!("unexpected buckets value {:?}", other),
        }
    }

    pub async fn get(&self, key: &Key) -> Option<Value> {
        self.leader().client().get(key).await.unwrap()
    }

    pub async fn stop(mut self) {
        for manager in self.managers.iter_mut() {
            manager.stop().await;
        }
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
