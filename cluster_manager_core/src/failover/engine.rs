//! Failover worker lifecycle
//!
//! `FailoverEngine::start` rejects impossible requests up front, then
//! spawns a worker and waits until the worker has either passed its
//! majority checks or exited. The caller gets a handle to join for the
//! final report.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::collaborators::{AuditEvent, Collaborators};
use super::{is_possible, FailoverOptions, FailoverReport};
use crate::bucket::BucketConfig;
use crate::config::ManagerConfig;
use crate::coordinator::CoordinatorClient;
use crate::error::{FailoverError, FailoverResult};
use crate::log::log_failover_operation;
use crate::map_repair::can_preserve_durability_majority;
use crate::membership::{ClusterView, NodeId};
use crate::metrics::MetricsCollector;
use crate::quorum::{Key, QuorumClient, Value};

/// Runs failovers on behalf of one node
#[derive(Clone)]
pub struct FailoverEngine {
    inner: Arc<EngineInner>,
}

pub(super) struct EngineInner {
    pub(super) node: NodeId,
    pub(super) client: QuorumClient,
    pub(super) coordinator: CoordinatorClient,
    pub(super) collaborators: Collaborators,
    pub(super) config: ManagerConfig,
    pub(super) metrics: Arc<MetricsCollector>,
    /// One failover at a time per engine; across nodes the store lease applies
    running: Mutex<()>,
}

/// A failover worker that passed its start checks
pub struct FailoverHandle {
    task: JoinHandle<FailoverResult<FailoverReport>>,
}

impl FailoverHandle {
    /// Wait for the worker's report
    pub async fn join(self) -> FailoverResult<FailoverReport> {
        self.task
            .await
            .map_err(|e| FailoverError::WorkerExited(e.to_string()))?
    }
}

impl FailoverEngine {
    pub fn new(
        node: NodeId,
        client: QuorumClient,
        coordinator: CoordinatorClient,
        collaborators: Collaborators,
        config: ManagerConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                node,
                client,
                coordinator,
                collaborators,
                config,
                metrics,
                running: Mutex::new(()),
            }),
        }
    }

    /// Start failing over `nodes`.
    ///
    /// Returns once the worker has started; feasibility and majority
    /// errors detected before that point are returned here.
    pub async fn start(&self, nodes: BTreeSet<NodeId>, options: FailoverOptions) -> FailoverResult<FailoverHandle> {
        let view = ClusterView::load(&self.inner.client).await?;
        is_possible(&view, &nodes, &options)?;

        let (started_tx, started_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run(nodes, options, started_tx).await });

        if started_rx.await.is_ok() {
            return Ok(FailoverHandle { task });
        }

        // The worker exited before signalling; surface its error
        match task.await {
            Ok(Err(e)) => Err(e),
            Ok(Ok(_)) => Err(FailoverError::WorkerExited("finished without starting".to_string())),
            Err(e) => Err(FailoverError::WorkerExited(e.to_string())),
        }
    }

    /// Start a failover and wait for its report
    pub async fn failover(&self, nodes: BTreeSet<NodeId>, options: FailoverOptions) -> FailoverResult<FailoverReport> {
        self.start(nodes, options).await?.join().await
    }

    /// Whether failing over `nodes` keeps a durability majority in every
    /// persistent bucket
    pub async fn preserves_durability_majority(&self, nodes: &BTreeSet<NodeId>) -> FailoverResult<bool> {
        let buckets = self.inner.load_buckets().await?;
        Ok(buckets.values().all(|bucket| match (&bucket.map, bucket.is_persistent()) {
            (Some(map), true) => can_preserve_durability_majority(map, nodes),
            _ => true,
        }))
    }
}

impl EngineInner {
    async fn run(
        self: Arc<Self>,
        nodes: BTreeSet<NodeId>,
        options: FailoverOptions,
        started: oneshot::Sender<()>,
    ) -> FailoverResult<FailoverReport> {
        let _running = self.running.lock().await;
        let start_time = Instant::now();

        tracing::info!("Node {} starting failover of {:?}", self.node, nodes);
        self.metrics.record_failover_started(nodes.len());
        self.collaborators.audit.emit(AuditEvent::FailoverStarted { nodes: nodes.clone() });

        let result = self.run_with_majority(&nodes, options, started).await;
        let duration = start_time.elapsed();
        let success = result.is_ok();

        let mut fields = vec![("outcome", result.as_ref().err().map_or("ok", FailoverError::code).to_string())];
        if let Ok(report) = &result {
            if let Some(reference) = &report.failover_ref {
                fields.push(("reference", reference.clone()));
            }
        }
        log_failover_operation(&nodes, success, duration, Some(fields));
        self.metrics.record_failover_finished(success, nodes.len(), duration);
        self.collaborators.audit.emit(AuditEvent::FailoverEnded {
            nodes: nodes.clone(),
            success,
            code: result.as_ref().err().map(FailoverError::code),
        });

        if let Err(e) = &result {
            tracing::error!("Failover of {:?} failed: {}", nodes, e);
        }
        result
    }

    /// Establish that the failover may proceed, signal `started` and orchestrate
    async fn run_with_majority(
        &self,
        nodes: &BTreeSet<NodeId>,
        mut options: FailoverOptions,
        started: oneshot::Sender<()>,
    ) -> FailoverResult<FailoverReport> {
        if options.allow_unsafe && self.config.node.consensus_enabled {
            let reference = hex::encode(rand::random::<[u8; 16]>());
            tracing::warn!("Starting quorum-loss failover of {:?} with reference {}", nodes, reference);

            self.coordinator.start_failover(nodes.clone(), reference.clone()).await?;
            if !self.client.store().has_quorum().await {
                return Err(FailoverError::QuorumLost);
            }
            options.failover_ref = Some(reference);
        } else {
            let store = self.client.store();
            if !store.has_quorum().await {
                tracing::warn!("Refusing failover of {:?}: no quorum", nodes);
                return Err(FailoverError::OrchestrationUnsafe);
            }
            if self.client.get(&Key::failover_opaque()).await?.is_some() {
                tracing::warn!("Refusing failover of {:?}: previous failover unfinished", nodes);
                return Err(FailoverError::OrchestrationUnsafe);
            }
        }

        // Nobody waiting any more is fine; the failover still runs
        let _ = started.send(());
        let mut report = match self.orchestrate(nodes, &options).await {
            Err(FailoverError::CannotAcquireLock) if !self.client.store().has_quorum().await => {
                tracing::warn!("Lock for failover of {:?} lost with quorum", nodes);
                return Err(FailoverError::QuorumLost);
            }
            result => result?,
        };
        report.finished_at = Some(chrono::Utc::now());
        Ok(report)
    }

    pub(super) async fn load_buckets(&self) -> FailoverResult<std::collections::BTreeMap<String, BucketConfig>> {
        match self.client.get(&Key::buckets()).await? {
            None => Ok(Default::default()),
            Some(Value::Buckets(buckets)) => Ok(buckets),
            Some(_) => Err(crate::error::StoreError::InvalidValue {
                key: Key::buckets().to_string(),
                expected: "bucket configs",
            }
            .into()),
        }
    }
}
