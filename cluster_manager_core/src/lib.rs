pub mod bucket;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod failover;
pub mod log;
pub mod map_repair;
pub mod membership;
pub mod metrics;
pub mod quorum;

pub use bucket::{BucketConfig, BucketType, Chain, VbucketId, VbucketMap};
pub use cluster::{ClusterManager, ClusterStatus, SharedServices};
pub use config::ManagerConfig;
pub use coordinator::{CoordinatorClient, LeaderElection, Operation, SingletonRegistry};
pub use error::{FailoverError, MembershipError, StoreError, TopologyError};
pub use failover::{FailoverEngine, FailoverOptions, FailoverReport};
pub use membership::{ClusterView, Membership, NodeId, RecoveryType, Service};
pub use quorum::{InMemoryQuorumStore, Key, QuorumClient, QuorumStore, Value};
