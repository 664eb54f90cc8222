//! Master-singleton topology coordinator
//!
//! All topology mutations are serialized through one coordinator instance
//! and one operation record in the quorum store. A mutation runs as:
//!
//! 1. acquire the store lock,
//! 2. commit the membership writes together with the operation record,
//! 3. apply the consensus membership change under the same lock,
//! 4. delete the record.
//!
//! A record left behind by a crashed or demoted coordinator is recovered
//! either by the next request (which finds a record for a different
//! operation) or by the janitor. A node removing itself writes a delegated
//! record and surrenders leadership so the next leader finishes the job.

pub mod client;
pub mod election;
pub mod operation;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub use client::CoordinatorClient;
pub use election::{LeaderElection, SingletonRegistry, SingletonSupervisor};
pub use operation::{FailoverOpaque, Operation, OperationKind, OperationRecord};

use crate::error::{TopologyError, TopologyResult};
use crate::log::{log_janitor_run, log_topology_operation};
use crate::membership::{registry, ClusterView, NodeId};
use crate::metrics::MetricsCollector;
use crate::quorum::{Key, KeyEvent, Lock, Outcome, PeerRole, QuorumClient, Txn, Value, Write};

const MAILBOX_SIZE: usize = 64;

type Reply = oneshot::Sender<TopologyResult<()>>;

/// Message accepted by the coordinator
#[derive(Debug)]
pub enum Request {
    Operation {
        operation: Operation,
        reply: Reply,
    },
    StartFailover {
        nodes: BTreeSet<NodeId>,
        reference: String,
        reply: Reply,
    },
    CompleteFailover {
        nodes: BTreeSet<NodeId>,
        reference: String,
        reply: Reply,
    },
}

/// Address of a running coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    node: NodeId,
    tx: mpsc::Sender<Request>,
}

impl CoordinatorHandle {
    /// Node the coordinator runs on
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub(crate) async fn send(&self, request: Request) -> TopologyResult<()> {
        self.tx.send(request).await.map_err(|_| TopologyError::CoordinatorStopped)
    }
}

/// Everything a coordinator instance needs, shared by the supervisor
#[derive(Clone)]
pub struct CoordinatorContext {
    pub node: NodeId,
    pub client: QuorumClient,
    pub election: Arc<LeaderElection>,
    pub registry: Arc<SingletonRegistry>,
    pub metrics: Arc<MetricsCollector>,
    pub janitor_interval: Duration,
    pub max_recovery_attempts: u32,
}

/// A started coordinator task
pub struct RunningCoordinator {
    handle: CoordinatorHandle,
    stop_tx: mpsc::Sender<()>,
    task_handle: tokio::task::JoinHandle<()>,
}

impl RunningCoordinator {
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.task_handle.await;
    }
}

/// Result of writing an operation record
enum Prepared {
    /// Record written; `false` when there was nothing left to recover
    Ready(bool),
    /// Another operation's record must be recovered first
    Conflict(OperationRecord),
}

enum PrepareAbort {
    Conflict(OperationRecord),
    Failed(TopologyError),
}

/// Outcome of one attempt at a requested operation
enum Attempt {
    Done,
    Recovered,
}

pub struct TopologyCoordinator {
    ctx: CoordinatorContext,
    janitor_deadline: Option<Instant>,
    surrendered: bool,
}

impl TopologyCoordinator {
    /// Start a coordinator on `ctx.node`.
    ///
    /// Returns `None` without starting anything when the node is not in
    /// `nodes_wanted`.
    pub async fn start(ctx: CoordinatorContext) -> TopologyResult<Option<RunningCoordinator>> {
        // Subscribe before reading so no update of the record is missed
        let events = ctx.client.subscribe(|key| *key == Key::topology_operation());

        let view = ClusterView::load(&ctx.client).await?;
        if !view.is_wanted(&ctx.node) {
            return Ok(None);
        }

        let mut coordinator = TopologyCoordinator {
            ctx,
            janitor_deadline: None,
            surrendered: false,
        };

        let delegated = matches!(
            coordinator.ctx.client.get(&Key::topology_operation()).await?,
            Some(Value::Operation(record)) if record.is_delegated()
        );
        if delegated {
            tracing::info!("Found delegated operation record, running janitor now");
            coordinator.janitor_deadline = Some(Instant::now());
        } else {
            coordinator.arm_janitor();
        }

        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = CoordinatorHandle {
            node: coordinator.ctx.node.clone(),
            tx,
        };

        tracing::info!("Topology coordinator started on {}", coordinator.ctx.node);
        let task_handle = tokio::spawn(async move {
            coordinator.run(rx, events, stop_rx).await;
        });

        Ok(Some(RunningCoordinator {
            handle,
            stop_tx,
            task_handle,
        }))
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut events: mpsc::UnboundedReceiver<KeyEvent>,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(request) = requests.recv() => {
                    self.handle_request(request).await;
                }
                Some(event) = events.recv() => {
                    self.handle_event(event);
                }
                _ = wait_for(self.janitor_deadline) => {
                    self.run_janitor().await;
                }
                _ = stop_rx.recv() => {
                    tracing::info!("Topology coordinator on {} stopping", self.ctx.node);
                    break;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Operation { operation, reply } => {
                let result = self.execute(&operation).await;
                let _ = reply.send(result);
            }
            Request::StartFailover {
                nodes,
                reference,
                reply,
            } => {
                let result = self.start_failover(nodes, reference).await;
                let _ = reply.send(result);
            }
            Request::CompleteFailover {
                nodes,
                reference,
                reply,
            } => {
                let result = self.complete_failover(nodes, reference).await;
                let _ = reply.send(result);
            }
        }
    }

    fn handle_event(&mut self, event: KeyEvent) {
        if self.surrendered {
            return;
        }
        if let Some(Value::Operation(record)) = &event.value {
            if record.coordinator != self.ctx.node {
                tracing::debug!(
                    "Operation record {} published by {}, running janitor",
                    record.operation,
                    record.coordinator
                );
                self.janitor_deadline = Some(Instant::now());
            }
        }
    }

    fn arm_janitor(&mut self) {
        if !self.surrendered {
            self.janitor_deadline = Some(Instant::now() + self.ctx.janitor_interval);
        }
    }

    async fn acquire_lock(&self) -> TopologyResult<Lock> {
        self.ctx.client.acquire_lock().await.map_err(|e| {
            tracing::warn!("Failed to acquire lock on {}: {}", self.ctx.node, e);
            TopologyError::CannotAcquireLock
        })
    }

    /// Run a requested operation, recovering interrupted ones first
    async fn execute(&mut self, operation: &Operation) -> TopologyResult<()> {
        if self.surrendered {
            return Err(TopologyError::CoordinatorStopped);
        }

        self.janitor_deadline = None;
        let start_time = std::time::Instant::now();
        let mut recoveries = 0;

        let result = loop {
            match self.attempt(operation).await {
                Ok(Attempt::Done) => break Ok(()),
                Ok(Attempt::Recovered) => {
                    recoveries += 1;
                    if self.surrendered {
                        break Err(TopologyError::CoordinatorStopped);
                    }
                    if recoveries > self.ctx.max_recovery_attempts {
                        break Err(TopologyError::RecoveryLimitExceeded(self.ctx.max_recovery_attempts));
                    }
                    tracing::info!("Retrying {} after recovery", operation);
                }
                Err(e) => break Err(e),
            }
        };

        let duration = start_time.elapsed();
        log_topology_operation(operation.name(), &self.ctx.node, result.is_ok(), duration);
        self.ctx
            .metrics
            .record_topology_operation(operation.name(), result.is_ok(), duration);

        if let Err(e) = &result {
            tracing::error!("Topology operation {} failed: {}", operation, e);
            // A failed attempt may leave a record behind
            self.arm_janitor();
        }
        result
    }

    async fn attempt(&mut self, operation: &Operation) -> TopologyResult<Attempt> {
        let lock = self.acquire_lock().await?;
        match self.prepare(operation, lock, None).await? {
            Prepared::Ready(_) => {
                self.finish(operation, lock).await?;
                Ok(Attempt::Done)
            }
            Prepared::Conflict(record) => {
                self.recover(record, lock).await?;
                Ok(Attempt::Recovered)
            }
        }
    }

    /// Commit the membership writes of `operation` together with its record.
    ///
    /// `interrupted` is the operation whose record `operation` is allowed to
    /// replace when running as a recovery.
    async fn prepare(
        &self,
        operation: &Operation,
        lock: Lock,
        interrupted: Option<&Operation>,
    ) -> TopologyResult<Prepared> {
        let node = &self.ctx.node;
        let op_key = Key::topology_operation();
        let mut keys = vec![op_key.clone(), Key::failover_opaque()];
        keys.extend(operation.keys());

        let outcome = self
            .ctx
            .client
            .transaction(&keys, Some(lock), |snapshot| {
                if snapshot.contains(&Key::failover_opaque()) {
                    return Txn::Abort(PrepareAbort::Failed(TopologyError::UnfinishedFailover));
                }

                let existing = match snapshot.typed(&op_key, Value::as_operation, "operation record") {
                    Ok(existing) => existing,
                    Err(e) => return Txn::Abort(PrepareAbort::Failed(e.into())),
                };

                let apply_membership = match (existing, interrupted) {
                    // Same operation already committed its membership writes
                    (Some(record), _) if record.operation == *operation => false,
                    (Some(record), Some(interrupted)) if record.operation == *interrupted => true,
                    (Some(record), _) => return Txn::Abort(PrepareAbort::Conflict(record.clone())),
                    // Someone finished the interrupted operation already
                    (None, Some(_)) => return Txn::Commit(Vec::new(), false),
                    (None, None) => true,
                };

                let mut writes = if apply_membership {
                    match operation.membership_writes(snapshot, node) {
                        Ok(writes) => writes,
                        Err(e) => return Txn::Abort(PrepareAbort::Failed(e.into())),
                    }
                } else {
                    Vec::new()
                };
                let record = OperationRecord::regular(operation.clone(), lock, node.clone());
                writes.push(Write::Set(op_key.clone(), record.into()));
                Txn::Commit(writes, true)
            })
            .await?;

        match outcome {
            Outcome::Committed(ready) => Ok(Prepared::Ready(ready)),
            Outcome::Aborted(PrepareAbort::Conflict(record)) => Ok(Prepared::Conflict(record)),
            Outcome::Aborted(PrepareAbort::Failed(e)) => Err(e),
        }
    }

    /// Drive an interrupted operation to a consistent state
    async fn recover(&mut self, record: OperationRecord, lock: Lock) -> TopologyResult<()> {
        let recovery = record.operation.recovery();
        tracing::warn!(
            "Recovering interrupted {} (written by {}) with {}",
            record.operation,
            record.coordinator,
            recovery
        );
        self.ctx.metrics.record_recovery(recovery.name());

        match self.prepare(&recovery, lock, Some(&record.operation)).await? {
            Prepared::Ready(true) => self.finish(&recovery, lock).await,
            Prepared::Ready(false) => Ok(()),
            Prepared::Conflict(other) => {
                tracing::warn!("Operation record changed to {} during recovery", other.operation);
                Ok(())
            }
        }
    }

    /// Apply the consensus membership change and clear the record, or hand
    /// the operation off when it removes this node
    async fn finish(&mut self, operation: &Operation, lock: Lock) -> TopologyResult<()> {
        if operation.is_delegatable(&self.ctx.node) {
            return self.delegate(operation, lock).await;
        }

        self.apply_topology(operation, lock).await?;

        let op_key = Key::topology_operation();
        self.ctx
            .client
            .transaction(&[op_key.clone()], Some(lock), |snapshot| {
                match snapshot.typed(&op_key, Value::as_operation, "operation record") {
                    Ok(Some(record)) if record.operation == *operation => {
                        Txn::Commit(vec![Write::Delete(op_key.clone())], ())
                    }
                    Ok(_) => Txn::Commit(Vec::new(), ()),
                    Err(e) => Txn::Abort(e),
                }
            })
            .await?
            .into_result()?;
        Ok(())
    }

    async fn delegate(&mut self, operation: &Operation, lock: Lock) -> TopologyResult<()> {
        let op_key = Key::topology_operation();
        let record = OperationRecord::regular(operation.clone(), lock, self.ctx.node.clone()).delegated();

        self.ctx
            .client
            .transaction(&[op_key.clone()], Some(lock), |_| {
                Txn::<(), TopologyError>::Commit(vec![Write::Set(op_key.clone(), record.clone().into())], ())
            })
            .await?
            .into_result()?;

        tracing::warn!("Handing {} off to the next leader, surrendering mastership", operation);
        self.ctx.metrics.record_delegation();
        self.surrendered = true;
        self.janitor_deadline = None;
        self.ctx.election.surrender(&self.ctx.node);
        Ok(())
    }

    async fn apply_topology(&self, operation: &Operation, lock: Lock) -> TopologyResult<()> {
        let store = self.ctx.client.store();
        match operation {
            Operation::AddReplica { node, .. } => store.add_replica(lock, node).await?,
            Operation::RemovePeer { node } => store.remove_peer(lock, node).await?,
            Operation::ActivateNodes { nodes } => {
                let roles: Vec<(NodeId, PeerRole)> = nodes.iter().map(|n| (n.clone(), PeerRole::Voter)).collect();
                store.set_peer_roles(lock, &roles).await?
            }
            Operation::DeactivateNodes { nodes } => {
                let roles: Vec<(NodeId, PeerRole)> = nodes.iter().map(|n| (n.clone(), PeerRole::Replica)).collect();
                store.set_peer_roles(lock, &roles).await?
            }
        }
        Ok(())
    }

    async fn run_janitor(&mut self) {
        self.janitor_deadline = None;
        self.ctx.metrics.record_janitor_run();

        let outcome = match self.janitor_pass().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Janitor pass on {} failed: {}", self.ctx.node, e);
                self.arm_janitor();
                "error"
            }
        };
        log_janitor_run(&self.ctx.node, outcome);
    }

    async fn janitor_pass(&mut self) -> TopologyResult<&'static str> {
        let lock = match self.acquire_lock().await {
            Ok(lock) => lock,
            Err(_) => {
                self.arm_janitor();
                return Ok("lock_unavailable");
            }
        };

        let op_key = Key::topology_operation();
        let opaque_key = Key::failover_opaque();
        let snapshot = self.ctx.client.snapshot(&[op_key.clone(), opaque_key.clone()]).await?;

        if snapshot.contains(&opaque_key) {
            return Ok("unfinished_failover");
        }

        match snapshot.typed(&op_key, Value::as_operation, "operation record")? {
            None => Ok("idle"),
            Some(record) => {
                self.recover(record.clone(), lock).await?;
                Ok("recovered")
            }
        }
    }

    /// Drop `nodes` from the consensus membership without a majority.
    ///
    /// The compatibility check and the reconfiguration share one read of
    /// the failover marker; a marker written in between fails the call.
    async fn start_failover(&mut self, nodes: BTreeSet<NodeId>, reference: String) -> TopologyResult<()> {
        let opaque_key = Key::failover_opaque();
        let snapshot = self.ctx.client.snapshot(&[opaque_key.clone()]).await?;
        if let Some(previous) = snapshot.typed(&opaque_key, Value::as_failover_opaque, "failover opaque")? {
            if !previous.nodes.is_subset(&nodes) {
                tracing::warn!(
                    "Failover of {:?} is incompatible with unfinished failover {} of {:?}",
                    nodes,
                    previous.reference,
                    previous.nodes
                );
                return Err(TopologyError::IncompatibleWithPrevious);
            }
        }

        let store = self.ctx.client.store();
        let keep: BTreeSet<NodeId> = store
            .peers()
            .await
            .into_keys()
            .filter(|n| !nodes.contains(n))
            .collect();

        tracing::warn!("Starting quorum-loss failover {} of {:?}, keeping {:?}", reference, nodes, keep);
        let opaque = FailoverOpaque { reference, nodes };
        store
            .failover(&keep, snapshot.read_set(), vec![Write::Set(opaque_key, opaque.into())])
            .await?;
        Ok(())
    }

    /// Deactivate the nodes of a quorum-loss failover and clear its marker
    async fn complete_failover(&mut self, nodes: BTreeSet<NodeId>, reference: String) -> TopologyResult<()> {
        let lock = self.acquire_lock().await?;
        let opaque_key = Key::failover_opaque();
        let nodes: Vec<NodeId> = nodes.into_iter().collect();
        let mut keys = registry::membership_change_keys();
        keys.push(opaque_key.clone());

        self.ctx
            .client
            .transaction(&keys, Some(lock), |snapshot| {
                match snapshot.typed(&opaque_key, Value::as_failover_opaque, "failover opaque") {
                    Err(e) => Txn::Abort(e.into()),
                    Ok(None) => Txn::Abort(TopologyError::NoFailoverInProgress),
                    Ok(Some(opaque)) if opaque.reference != reference => {
                        Txn::Abort(TopologyError::FailoverReferenceMismatch)
                    }
                    Ok(Some(_)) => match registry::deactivate(snapshot, &nodes) {
                        Ok(mut writes) => {
                            writes.push(Write::Delete(opaque_key.clone()));
                            Txn::Commit(writes, ())
                        }
                        Err(e) => Txn::Abort(e.into()),
                    },
                }
            })
            .await?
            .into_result()?;

        tracing::info!("Quorum-loss failover {} completed", reference);
        Ok(())
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
