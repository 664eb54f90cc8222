//! Optimistic transaction client over a `QuorumStore`

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};

use super::{Commit, Key, KeyEvent, Lock, QuorumStore, Snapshot, Value, Versioned, Write};
use crate::error::{StoreError, StoreResult};
use crate::metrics::MetricsCollector;

/// Result of a transaction function
#[derive(Debug)]
pub enum Txn<C, A> {
    /// Apply the writes and hand `C` back to the caller
    Commit(Vec<Write>, C),
    /// Apply nothing and hand the reason back
    Abort(A),
}

/// Result of a transaction after it went through the store
#[derive(Debug, PartialEq)]
pub enum Outcome<C, A> {
    Committed(C),
    Aborted(A),
}

impl<C, A> Outcome<C, A> {
    pub fn into_result(self) -> Result<C, A> {
        match self {
            Outcome::Committed(c) => Ok(c),
            Outcome::Aborted(a) => Err(a),
        }
    }
}

/// Client running compare-and-swap transactions against the store
#[derive(Clone)]
pub struct QuorumClient {
    store: Arc<dyn QuorumStore>,
    max_retries: u32,
    metrics: Option<Arc<MetricsCollector>>,
}

impl QuorumClient {
    pub fn new(store: Arc<dyn QuorumStore>, max_retries: u32) -> Self {
        Self {
            store,
            max_retries,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn QuorumStore> {
        &self.store
    }

    pub async fn get(&self, key: &Key) -> StoreResult<Option<Value>> {
        Ok(self.store.get(key).await?.map(|Versioned { value, .. }| value))
    }

    pub async fn snapshot(&self, keys: &[Key]) -> StoreResult<Snapshot> {
        self.store.snapshot(keys).await
    }

    pub async fn acquire_lock(&self) -> StoreResult<Lock> {
        self.store.acquire_lock().await
    }

    /// Run `f` over a fresh snapshot of `keys` and commit its writes.
    ///
    /// Conflicting commits are retried with a new snapshot until the retry
    /// budget runs out, at which point `StoreError::ExceededRetries` is
    /// returned. A transaction that writes nothing is not sent to the store.
    pub async fn transaction<F, C, A>(
        &self,
        keys: &[Key],
        lock: Option<Lock>,
        mut f: F,
    ) -> StoreResult<Outcome<C, A>>
    where
        F: FnMut(&Snapshot) -> Txn<C, A>,
    {
        let start_time = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let snapshot = self.store.snapshot(keys).await?;

            let (writes, result) = match f(&snapshot) {
                Txn::Abort(reason) => return Ok(Outcome::Aborted(reason)),
                Txn::Commit(writes, result) => (writes, result),
            };

            if writes.is_empty() {
                return Ok(Outcome::Committed(result));
            }

            let commit = Commit {
                read_set: snapshot.read_set(),
                writes,
                lock,
            };

            match self.store.commit(commit).await {
                Ok(revision) => {
                    tracing::debug!(
                        "Transaction committed at revision {} after {} attempt(s) in {:?}",
                        revision.0,
                        attempts,
                        start_time.elapsed()
                    );
                    return Ok(Outcome::Committed(result));
                }
                Err(StoreError::Conflict) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_transaction_retry();
                    }
                    if attempts >= self.max_retries {
                        tracing::error!("Transaction over {:?} exceeded {} retries", keys, attempts);
                        return Err(StoreError::ExceededRetries { attempts });
                    }
                    tracing::debug!("Transaction conflict on attempt {}, retrying", attempts);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deliver change events whose key matches `predicate` to a channel
    /// owned by the caller.
    pub fn subscribe<P>(&self, predicate: P) -> mpsc::UnboundedReceiver<KeyEvent>
    where
        P: Fn(&Key) -> bool + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = self.store.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if predicate(&event.key) && tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Subscriber lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }
}
