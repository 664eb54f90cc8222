use std::collections::{BTreeMap, BTreeSet};
use serde::{Deserialize, Serialize};

use crate::bucket::BucketConfig;
use crate::coordinator::operation::{FailoverOpaque, OperationRecord};
use crate::failover::lease::FailoverLease;
use crate::failover::vbuckets::FailoverVbuckets;
use crate::membership::{Membership, NodeId, RecoveryType, ServerGroup, Service};

/// Typed value stored under a quorum store key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Nodes(BTreeSet<NodeId>),
    Membership(Membership),
    RecoveryType(RecoveryType),
    Services(BTreeSet<Service>),
    ServerGroups(Vec<ServerGroup>),
    Buckets(BTreeMap<String, BucketConfig>),
    Operation(OperationRecord),
    FailoverOpaque(FailoverOpaque),
    FailoverVbuckets(FailoverVbuckets),
    FailoverLease(FailoverLease),
}

impl Value {
    pub fn as_nodes(&self) -> Option<&BTreeSet<NodeId>> {
        match self {
            Value::Nodes(nodes) => Some(nodes),
            _ => None,
        }
    }

    pub fn as_membership(&self) -> Option<&Membership> {
        match self {
            Value::Membership(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_recovery_type(&self) -> Option<&RecoveryType> {
        match self {
            Value::RecoveryType(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_services(&self) -> Option<&BTreeSet<Service>> {
        match self {
            Value::Services(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_server_groups(&self) -> Option<&Vec<ServerGroup>> {
        match self {
            Value::ServerGroups(groups) => Some(groups),
            _ => None,
        }
    }

    pub fn as_buckets(&self) -> Option<&BTreeMap<String, BucketConfig>> {
        match self {
            Value::Buckets(buckets) => Some(buckets),
            _ => None,
        }
    }

    pub fn as_operation(&self) -> Option<&OperationRecord> {
        match self {
            Value::Operation(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_failover_opaque(&self) -> Option<&FailoverOpaque> {
        match self {
            Value::FailoverOpaque(opaque) => Some(opaque),
            _ => None,
        }
    }

    pub fn as_failover_vbuckets(&self) -> Option<&FailoverVbuckets> {
        match self {
            Value::FailoverVbuckets(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_failover_lease(&self) -> Option<&FailoverLease> {
        match self {
            Value::FailoverLease(lease) => Some(lease),
            _ => None,
        }
    }
}

impl From<Membership> for Value {
    fn from(m: Membership) -> Self {
        Value::Membership(m)
    }
}

impl From<RecoveryType> for Value {
    fn from(r: RecoveryType) -> Self {
        Value::RecoveryType(r)
    }
}

impl From<OperationRecord> for Value {
    fn from(record: OperationRecord) -> Self {
        Value::Operation(record)
    }
}

impl From<FailoverOpaque> for Value {
    fn from(opaque: FailoverOpaque) -> Self {
        Value::FailoverOpaque(opaque)
    }
}

impl From<FailoverVbuckets> for Value {
    fn from(v: FailoverVbuckets) -> Self {
        Value::FailoverVbuckets(v)
    }
}

impl From<FailoverLease> for Value {
    fn from(lease: FailoverLease) -> Self {
        Value::FailoverLease(lease)
    }
}
