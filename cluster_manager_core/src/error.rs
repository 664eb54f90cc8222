//! Error types for the cluster manager control plane
//!
//! Every layer has its own error enum. Lower layers convert into higher ones
//! with `#[from]` so callers can propagate with `?`; lost quorum is lifted to
//! `FailoverError::QuorumLost` by hand.

use crate::membership::NodeId;
use thiserror::Error;

/// Result type for quorum store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for topology coordinator operations
pub type TopologyResult<T> = std::result::Result<T, TopologyError>;

/// Result type for failover operations
pub type FailoverResult<T> = std::result::Result<T, FailoverError>;

/// Errors raised by the quorum store or its client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A key in the read set changed between snapshot and commit
    #[error("transaction conflict")]
    Conflict,

    /// The client gave up after too many conflicting commits
    #[error("transaction exceeded {attempts} retries")]
    ExceededRetries { attempts: u32 },

    /// The store cannot currently reach a majority of voters
    #[error("no quorum")]
    NoQuorum,

    /// The lock attached to the commit is not the current lock
    #[error("lock is no longer held")]
    LockMismatch,

    /// Lock acquisition failed
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// A consensus membership call (add/remove peer, roles, failover) failed
    #[error("topology call failed: {0}")]
    TopologyCall(String),

    /// A stored value has an unexpected shape
    #[error("key {key} does not hold {expected}")]
    InvalidValue { key: String, expected: &'static str },
}

/// Reasons a membership transaction function aborts
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    #[error("node {0} is already a member")]
    NodePresent(NodeId),

    #[error("server group {0} not found")]
    GroupNotFound(String),

    #[error("node {0} is not failed over")]
    NotFailedOver(NodeId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the topology coordinator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("cannot acquire lock")]
    CannotAcquireLock,

    #[error("unfinished failover")]
    UnfinishedFailover,

    #[error("incompatible with previous failover")]
    IncompatibleWithPrevious,

    #[error("failover reference does not match")]
    FailoverReferenceMismatch,

    #[error("no failover in progress")]
    NoFailoverInProgress,

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no live topology coordinator")]
    NoCoordinator,

    #[error("topology coordinator call timed out")]
    Timeout,

    #[error("topology coordinator stopped")]
    CoordinatorStopped,

    #[error("gave up after {0} recovery attempts")]
    RecoveryLimitExceeded(u32),
}

impl TopologyError {
    /// Whether the coordinator client should retry the call
    pub fn is_call_failure(&self) -> bool {
        matches!(
            self,
            TopologyError::NoCoordinator | TopologyError::Timeout | TopologyError::CoordinatorStopped
        )
    }
}

/// A markable vbucket copy with no seqno stats
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no seqno stats for vbucket {vbucket} on {node}")]
pub struct MissingSeqnos {
    pub vbucket: crate::bucket::VbucketId,
    pub node: NodeId,
}

/// Errors surfaced by the failover engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FailoverError {
    #[error("no nodes given")]
    NoNodes,

    #[error("cannot fail over the last active kv node")]
    LastNode,

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("node {0} is not active")]
    InactiveNode(NodeId),

    #[error("orchestration is unsafe")]
    OrchestrationUnsafe,

    #[error("quorum lost during failover")]
    QuorumLost,

    #[error("incompatible with previous failover")]
    IncompatibleWithPrevious,

    #[error("cannot acquire lock")]
    CannotAcquireLock,

    #[error("failed to fail over bucket {bucket}: {reason}")]
    BucketFailed { bucket: String, reason: String },

    #[error("config sync failed: {0}")]
    ConfigSyncFailed(String),

    #[error(transparent)]
    Topology(TopologyError),

    #[error(transparent)]
    Store(StoreError),

    #[error("failover worker exited: {0}")]
    WorkerExited(String),
}

impl From<StoreError> for FailoverError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NoQuorum => FailoverError::QuorumLost,
            other => FailoverError::Store(other),
        }
    }
}

impl From<TopologyError> for FailoverError {
    fn from(e: TopologyError) -> Self {
        match e {
            TopologyError::CannotAcquireLock => FailoverError::CannotAcquireLock,
            TopologyError::IncompatibleWithPrevious => FailoverError::IncompatibleWithPrevious,
            TopologyError::UnfinishedFailover => FailoverError::OrchestrationUnsafe,
            TopologyError::Store(StoreError::NoQuorum)
            | TopologyError::Membership(MembershipError::Store(StoreError::NoQuorum)) => FailoverError::QuorumLost,
            other => FailoverError::Topology(other),
        }
    }
}

impl FailoverError {
    /// Stable tag reported to the operator-facing layer
    pub fn code(&self) -> &'static str {
        match self {
            FailoverError::NoNodes => "no_nodes",
            FailoverError::LastNode => "last_node",
            FailoverError::UnknownNode(_) => "unknown_node",
            FailoverError::InactiveNode(_) => "inactive_node",
            FailoverError::OrchestrationUnsafe => "orchestration_unsafe",
            FailoverError::QuorumLost => "quorum_lost",
            FailoverError::IncompatibleWithPrevious => "incompatible_with_previous",
            FailoverError::CannotAcquireLock => "cannot_acquire_lock",
            FailoverError::BucketFailed { .. } => "failed",
            FailoverError::ConfigSyncFailed(_) => "config_sync_failed",
            FailoverError::Topology(_) => "topology_error",
            FailoverError::Store(_) => "store_error",
            FailoverError::WorkerExited(_) => "worker_exited",
        }
    }
}
