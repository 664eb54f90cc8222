//! Leader election and singleton supervision for the topology coordinator
//!
//! Exactly one coordinator instance is live cluster-wide. `LeaderElection`
//! publishes the current leader on a watch channel, every node runs a
//! `SingletonSupervisor` that starts the coordinator while its node leads
//! and stops it on demotion, and `SingletonRegistry` is the name service
//! through which callers reach the live instance.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};

use super::{CoordinatorContext, CoordinatorHandle, RunningCoordinator, TopologyCoordinator};
use crate::membership::NodeId;

/// In-process leader election
#[derive(Debug)]
pub struct LeaderElection {
    leader: watch::Sender<Option<NodeId>>,
    candidates: RwLock<Vec<NodeId>>,
}

impl LeaderElection {
    pub fn new() -> Self {
        let (leader, _) = watch::channel(None);
        Self {
            leader,
            candidates: RwLock::new(Vec::new()),
        }
    }

    /// Make `node` eligible to take over after a surrender
    pub async fn register_candidate(&self, node: NodeId) {
        let mut candidates = self.candidates.write().await;
        if !candidates.contains(&node) {
            candidates.push(node);
        }
    }

    /// Remove `node` from the candidates; demotes it if it leads
    pub async fn withdraw(&self, node: &NodeId) {
        self.candidates.write().await.retain(|n| n != node);
        if self.leader().as_ref() == Some(node) {
            self.leader.send_replace(None);
        }
    }

    /// Install `node` as the leader
    pub fn elect(&self, node: NodeId) {
        tracing::info!("Node {} elected as topology coordinator leader", node);
        self.leader.send_replace(Some(node));
    }

    /// Give up leadership held by `node` and hand it to the next candidate
    pub fn surrender(&self, node: &NodeId) {
        if self.leader().as_ref() != Some(node) {
            return;
        }

        let next = self
            .candidates
            .try_read()
            .ok()
            .and_then(|candidates| candidates.iter().find(|n| *n != node).cloned());

        tracing::info!("Node {} surrendered leadership, next leader: {:?}", node, next);
        self.leader.send_replace(next);
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader.borrow().clone()
    }

    /// Leadership change notifications
    pub fn watch(&self) -> watch::Receiver<Option<NodeId>> {
        self.leader.subscribe()
    }
}

impl Default for LeaderElection {
    fn default() -> Self {
        Self::new()
    }
}

/// Name service for the live coordinator instance
#[derive(Debug, Default)]
pub struct SingletonRegistry {
    live: RwLock<Option<CoordinatorHandle>>,
}

impl SingletonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: CoordinatorHandle) {
        *self.live.write().await = Some(handle);
    }

    /// Drop the registration if it still belongs to `node`
    pub async fn unregister(&self, node: &NodeId) {
        let mut live = self.live.write().await;
        if live.as_ref().map(CoordinatorHandle::node) == Some(node) {
            *live = None;
        }
    }

    pub async fn lookup(&self) -> Option<CoordinatorHandle> {
        self.live.read().await.clone()
    }
}

/// Runs the coordinator on its node while that node is the leader
pub struct SingletonSupervisor {
    node: NodeId,
    stop_tx: Option<mpsc::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SingletonSupervisor {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            stop_tx: None,
            task_handle: None,
        }
    }

    /// Start following leadership changes
    pub fn start(&mut self, ctx: CoordinatorContext) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        self.stop_tx = Some(stop_tx);

        let task_handle = tokio::spawn(async move {
            Self::run_supervision_loop(ctx, stop_rx).await;
        });
        self.task_handle = Some(task_handle);
    }

    /// Stop supervising and tear down the coordinator if it runs here
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(task_handle) = self.task_handle.take() {
            let _ = task_handle.await;
        }
        tracing::debug!("Singleton supervisor on {} stopped", self.node);
    }

    async fn run_supervision_loop(ctx: CoordinatorContext, mut stop_rx: mpsc::Receiver<()>) {
        let election: Arc<LeaderElection> = Arc::clone(&ctx.election);
        let registry: Arc<SingletonRegistry> = Arc::clone(&ctx.registry);
        let mut leader_rx = election.watch();
        let mut running: Option<RunningCoordinator> = None;

        loop {
            let leader = leader_rx.borrow_and_update().clone();
            let is_leader = leader.as_ref() == Some(&ctx.node);

            if is_leader && running.is_none() {
                match TopologyCoordinator::start(ctx.clone()).await {
                    Ok(Some(coordinator)) => {
                        registry.register(coordinator.handle()).await;
                        running = Some(coordinator);
                    }
                    Ok(None) => {
                        tracing::info!("Node {} is not a wanted node, coordinator not started", ctx.node);
                    }
                    Err(e) => {
                        tracing::error!("Failed to start topology coordinator on {}: {}", ctx.node, e);
                    }
                }
            } else if !is_leader {
                if let Some(coordinator) = running.take() {
                    registry.unregister(&ctx.node).await;
                    coordinator.stop().await;
                }
            }

            tokio::select! {
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = stop_rx.recv() => {
                    break;
                }
            }
        }

        if let Some(coordinator) = running.take() {
            registry.unregister(&ctx.node).await;
            coordinator.stop().await;
        }
    }
}
