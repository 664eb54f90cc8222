//! Cluster-wide failover lease
//!
//! Each node runs its own failover engine, so the engine mutex alone does
//! not keep two nodes from failing each other over. The lease is a key in
//! the quorum store taken with a transaction before the feasibility
//! re-check and released after deactivation. A lease outlives a crashed
//! holder only until it expires.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{FailoverError, FailoverResult, StoreError};
use crate::membership::NodeId;
use crate::quorum::{Key, Outcome, QuorumClient, Txn, Value, Write};

/// Holder of the failover lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverLease {
    pub holder: NodeId,
    /// Unique per acquisition
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl FailoverLease {
    pub fn new(holder: NodeId, duration: Duration) -> Self {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            holder,
            token: hex::encode(rand::random::<[u8; 16]>()),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

enum Refusal {
    Held(FailoverLease),
    Invalid(StoreError),
}

/// Take the lease for `holder`.
///
/// An unexpired lease of another node is waited for, polling every
/// `retry_sleep`, for at most `wait`. Leases held by `holder` itself or by
/// one of `takeover_from` are replaced right away.
pub async fn acquire(
    client: &QuorumClient,
    holder: &NodeId,
    takeover_from: &BTreeSet<NodeId>,
    duration: Duration,
    wait: Duration,
    retry_sleep: Duration,
) -> FailoverResult<FailoverLease> {
    let key = Key::failover_lease();
    let deadline = Instant::now() + wait;

    loop {
        let lease = FailoverLease::new(holder.clone(), duration);
        let now = Utc::now();
        let outcome = client
            .transaction(&[key.clone()], None, |snapshot| {
                match snapshot.typed(&key, Value::as_failover_lease, "failover lease") {
                    Err(e) => Txn::Abort(Refusal::Invalid(e)),
                    Ok(Some(current))
                        if !current.is_expired(now)
                            && current.holder != *holder
                            && !takeover_from.contains(&current.holder) =>
                    {
                        Txn::Abort(Refusal::Held(current.clone()))
                    }
                    Ok(previous) => Txn::Commit(vec![Write::Set(key.clone(), lease.clone().into())], previous.cloned()),
                }
            })
            .await?;

        match outcome {
            Outcome::Committed(previous) => {
                if let Some(previous) = previous {
                    tracing::warn!(
                        "Node {} took over failover lease {} of {}",
                        holder,
                        previous.token,
                        previous.holder
                    );
                }
                tracing::debug!("Node {} holds failover lease {}", holder, lease.token);
                return Ok(lease);
            }
            Outcome::Aborted(Refusal::Invalid(e)) => return Err(e.into()),
            Outcome::Aborted(Refusal::Held(current)) => {
                if Instant::now() >= deadline {
                    tracing::warn!(
                        "Node {} gave up waiting for failover lease held by {}",
                        holder,
                        current.holder
                    );
                    return Err(FailoverError::CannotAcquireLock);
                }
                tracing::debug!("Failover lease held by {}; retrying", current.holder);
                tokio::time::sleep(retry_sleep).await;
            }
        }
    }
}

/// Drop `lease` unless another node has taken it over since.
///
/// Returns whether the lease was still ours.
pub async fn release(client: &QuorumClient, lease: &FailoverLease) -> FailoverResult<bool> {
    let key = Key::failover_lease();
    let released = client
        .transaction(&[key.clone()], None, |snapshot| {
            match snapshot.typed(&key, Value::as_failover_lease, "failover lease") {
                Err(e) => Txn::Abort(e),
                Ok(Some(current)) if current.token == lease.token => Txn::Commit(vec![Write::Delete(key.clone())], true),
                Ok(_) => Txn::Commit(Vec::new(), false),
            }
        })
        .await?
        .into_result()?;

    if !released {
        tracing::warn!("Failover lease {} of {} was taken over before release", lease.token, lease.holder);
    }
    Ok(released)
}
