//! Retrying client for the live topology coordinator

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::{Operation, Request, SingletonRegistry};
use crate::config::ManagerConfig;
use crate::error::{TopologyError, TopologyResult};
use crate::membership::{NodeId, Service};

/// Calls into whichever coordinator instance is currently registered.
///
/// Each call has its own timeout. Call-level failures (no live instance,
/// timeout, instance stopped mid-call) are retried with a fixed sleep;
/// typed errors from the coordinator are returned as they are.
#[derive(Clone)]
pub struct CoordinatorClient {
    registry: Arc<SingletonRegistry>,
    tries: u32,
    retry_sleep: Duration,
    call_timeout: Duration,
}

impl CoordinatorClient {
    pub fn new(registry: Arc<SingletonRegistry>, config: &ManagerConfig) -> Self {
        Self {
            registry,
            tries: config.coordinator.call_tries.max(1),
            retry_sleep: config.retry_sleep(),
            call_timeout: config.call_timeout(),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub async fn add_replica(
        &self,
        node: NodeId,
        group: Option<String>,
        services: BTreeSet<Service>,
    ) -> TopologyResult<()> {
        self.operation(Operation::AddReplica { node, group, services }).await
    }

    pub async fn remove_peer(&self, node: NodeId) -> TopologyResult<()> {
        self.operation(Operation::RemovePeer { node }).await
    }

    pub async fn activate_nodes(&self, nodes: Vec<NodeId>) -> TopologyResult<()> {
        self.operation(Operation::ActivateNodes { nodes }).await
    }

    pub async fn deactivate_nodes(&self, nodes: Vec<NodeId>) -> TopologyResult<()> {
        self.operation(Operation::DeactivateNodes { nodes }).await
    }

    /// Shrink the voting set to survive loss of quorum
    pub async fn start_failover(&self, nodes: BTreeSet<NodeId>, reference: String) -> TopologyResult<()> {
        self.call(|reply| Request::StartFailover {
            nodes: nodes.clone(),
            reference: reference.clone(),
            reply,
        })
        .await
    }

    /// Finish the failover started with the same `reference`
    pub async fn complete_failover(&self, nodes: BTreeSet<NodeId>, reference: String) -> TopologyResult<()> {
        self.call(|reply| Request::CompleteFailover {
            nodes: nodes.clone(),
            reference: reference.clone(),
            reply,
        })
        .await
    }

    async fn operation(&self, operation: Operation) -> TopologyResult<()> {
        self.call(|reply| Request::Operation {
            operation: operation.clone(),
            reply,
        })
        .await
    }

    async fn call<F>(&self, request: F) -> TopologyResult<()>
    where
        F: Fn(oneshot::Sender<TopologyResult<()>>) -> Request,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call_once(&request).await {
                Err(e) if e.is_call_failure() && attempt < self.tries => {
                    tracing::debug!("Coordinator call attempt {} failed: {}, retrying", attempt, e);
                    tokio::time::sleep(self.retry_sleep).await;
                }
                result => return result,
            }
        }
    }

    async fn call_once<F>(&self, request: &F) -> TopologyResult<()>
    where
        F: Fn(oneshot::Sender<TopologyResult<()>>) -> Request,
    {
        let handle = self.registry.lookup().await.ok_or(TopologyError::NoCoordinator)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle.send(request(reply_tx)).await?;

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Err(_) => Err(TopologyError::Timeout),
            Ok(Err(_)) => Err(TopologyError::CoordinatorStopped),
            Ok(Ok(result)) => result,
        }
    }
}
