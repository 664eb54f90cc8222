//! Bucket, service and membership steps of a failover

use std::collections::{BTreeMap, BTreeSet};

use tokio::time::timeout;

use super::collaborators::{AuditEvent, CleanupOutcome};
use super::engine::EngineInner;
use super::lease;
use super::vbuckets::{self, NodeFailoverVbuckets};
use super::{is_possible, BucketOutcome, BucketStatus, FailoverOptions, FailoverReport, ServiceFailure};
use crate::bucket::{BucketConfig, VbucketId, VbucketMap};
use crate::error::{FailoverError, FailoverResult};
use crate::map_repair::{lost_percentage, lost_vbuckets, markable_vbuckets, nodes_to_query, repair_map, VbucketSeqnos};
use crate::membership::{ClusterView, NodeId, Service};
use crate::quorum::{Key, Txn, Value, Write};

impl EngineInner {
    pub(super) async fn orchestrate(
        &self,
        nodes: &BTreeSet<NodeId>,
        options: &FailoverOptions,
    ) -> FailoverResult<FailoverReport> {
        if self.config.node.durability_aware {
            self.sync_config(nodes).await?;
        }

        // A quorum-loss failover has already cut the failed nodes off the store
        let takeover_from = match options.failover_ref {
            Some(_) => nodes.clone(),
            None => BTreeSet::new(),
        };
        let lease = lease::acquire(
            &self.client,
            &self.node,
            &takeover_from,
            self.config.lease_duration(),
            self.config.lease_wait(),
            self.config.retry_sleep(),
        )
        .await?;

        let result = self.orchestrate_leased(nodes, options).await;
        if let Err(e) = lease::release(&self.client, &lease).await {
            tracing::warn!("Failed to release failover lease {}: {}", lease.token, e);
        }
        result
    }

    async fn orchestrate_leased(
        &self,
        nodes: &BTreeSet<NodeId>,
        options: &FailoverOptions,
    ) -> FailoverResult<FailoverReport> {
        // The first check ran on data that may be stale by now
        let view = ClusterView::load(&self.client).await?;
        is_possible(&view, nodes, options)?;

        let mut report = FailoverReport::new(nodes, options.failover_ref.clone());
        let mut failover_vbuckets = NodeFailoverVbuckets::new();

        let buckets = self.failover_buckets(&view, nodes, &mut report, &mut failover_vbuckets).await;
        let persisted = vbuckets::persist(&self.client, &failover_vbuckets).await;
        buckets?;
        persisted?;

        let unsafe_nodes = self.failover_services(&view, nodes, options, &mut report).await;
        let deactivate: BTreeSet<NodeId> = nodes.difference(&unsafe_nodes).cloned().collect();

        match &options.failover_ref {
            Some(reference) => {
                self.coordinator.complete_failover(deactivate.clone(), reference.clone()).await?;
            }
            None if !deactivate.is_empty() => {
                self.coordinator
                    .deactivate_nodes(deactivate.iter().cloned().collect())
                    .await?;
            }
            None => {}
        }

        report.unsafe_nodes = unsafe_nodes;
        report.deactivated = deactivate;
        Ok(report)
    }

    async fn sync_config(&self, nodes: &BTreeSet<NodeId>) -> FailoverResult<()> {
        let view = ClusterView::load(&self.client).await?;
        let peers: BTreeSet<NodeId> = view.active_nodes().difference(nodes).cloned().collect();

        match timeout(self.config.config_sync_timeout(), self.collaborators.config_sync.pull(&peers)).await {
            Err(_) => Err(FailoverError::ConfigSyncFailed("timeout".to_string())),
            Ok(Err(reason)) => Err(FailoverError::ConfigSyncFailed(reason)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Fail over every bucket in turn; the first bucket error aborts the rest
    async fn failover_buckets(
        &self,
        view: &ClusterView,
        nodes: &BTreeSet<NodeId>,
        report: &mut FailoverReport,
        failover_vbuckets: &mut NodeFailoverVbuckets,
    ) -> FailoverResult<()> {
        let buckets = self.load_buckets().await?;
        for (name, config) in buckets {
            let outcome = self.failover_bucket(view, nodes, config, failover_vbuckets).await?;
            report.buckets.insert(name, outcome);
        }
        Ok(())
    }

    async fn failover_bucket(
        &self,
        view: &ClusterView,
        nodes: &BTreeSet<NodeId>,
        config: BucketConfig,
        failover_vbuckets: &mut NodeFailoverVbuckets,
    ) -> FailoverResult<BucketOutcome> {
        let janitor = &self.collaborators.bucket_janitor;
        match timeout(self.config.janitor_timeout(), janitor.check_server_list(&config, view)).await {
            Err(_) => return Err(bucket_failed(&config.name, "server list check timed out".to_string())),
            Ok(Err(reason)) => return Err(bucket_failed(&config.name, reason)),
            Ok(Ok(())) => {}
        }

        let durability_aware = self.config.node.durability_aware;
        let seqnos = match &config.map {
            Some(map) if config.is_persistent() => {
                vbuckets::record_bucket(failover_vbuckets, &config, nodes);
                if durability_aware {
                    self.query_seqnos(&config.name, map, nodes).await?
                } else {
                    VbucketSeqnos::new()
                }
            }
            _ => VbucketSeqnos::new(),
        };

        let (saved, lost) = self
            .save_bucket(&config.name, nodes, durability_aware.then_some(&seqnos))
            .await?;
        if !saved.is_persistent() || saved.map.is_none() {
            return Ok(BucketOutcome::ok());
        }

        if !lost.is_empty() {
            let total = saved.map.as_ref().map_or(0, Vec::len);
            let percentage = lost_percentage(lost.len(), total);
            tracing::error!(
                "Data lost in bucket {}: {} of {} vbuckets ({}%) have no live copy",
                saved.name,
                lost.len(),
                total,
                percentage
            );
            self.metrics.record_lost_vbuckets(&saved.name, lost.len());
            self.collaborators.audit.emit(AuditEvent::DataLost {
                bucket: saved.name.clone(),
                vbuckets: lost.clone(),
                percentage,
            });
        }

        let status = match timeout(self.config.janitor_timeout(), janitor.cleanup(&saved, nodes)).await {
            Ok(CleanupOutcome::Ok) => BucketStatus::Ok,
            Ok(CleanupOutcome::BadNodes(bad_nodes)) => {
                tracing::warn!("Janitor cleanup of bucket {} failed on {:?}", saved.name, bad_nodes);
                self.metrics.record_janitor_failure(&saved.name);
                BucketStatus::JanitorFailed { bad_nodes }
            }
            Ok(CleanupOutcome::Failed(reason)) => {
                tracing::warn!("Janitor cleanup of bucket {} failed: {}", saved.name, reason);
                self.metrics.record_janitor_failure(&saved.name);
                BucketStatus::JanitorFailed { bad_nodes: Vec::new() }
            }
            Err(_) => {
                tracing::warn!("Janitor cleanup of bucket {} timed out", saved.name);
                self.metrics.record_janitor_failure(&saved.name);
                BucketStatus::JanitorFailed { bad_nodes: Vec::new() }
            }
        };

        Ok(BucketOutcome {
            status,
            lost_vbuckets: lost,
        })
    }

    /// Fetch seqnos of every surviving copy of the markable vbuckets.
    ///
    /// A node failing to answer, or an answer missing any requested copy,
    /// fails the bucket.
    async fn query_seqnos(&self, bucket: &str, map: &VbucketMap, nodes: &BTreeSet<NodeId>) -> FailoverResult<VbucketSeqnos> {
        let markable = markable_vbuckets(map, nodes);
        if markable.is_empty() {
            return Ok(VbucketSeqnos::new());
        }

        let requests = nodes_to_query(&markable);
        tracing::debug!("Querying seqnos of {} vbuckets in bucket {} from {:?}", markable.len(), bucket, requests.keys());

        let rpc = &self.collaborators.vbucket_state;
        let answer = timeout(self.config.vbucket_query_timeout(), rpc.query_seqnos(bucket, &requests))
            .await
            .map_err(|_| bucket_failed(bucket, "vbucket seqno query timed out".to_string()))?;

        if !answer.failed_nodes.is_empty() {
            return Err(bucket_failed(
                bucket,
                format!("failed to get vbucket seqnos from {:?}", answer.failed_nodes),
            ));
        }

        for (node, vbuckets) in &requests {
            let answered = |vb: &VbucketId| answer.stats.get(vb).map_or(false, |per_node| per_node.contains_key(node));
            if let Some(vb) = vbuckets.iter().find(|vb| !answered(vb)) {
                return Err(bucket_failed(bucket, format!("no seqnos for vbucket {} from {}", vb, node)));
            }
        }
        Ok(answer.stats)
    }

    /// Apply the failover to the stored config of `bucket`.
    ///
    /// Works on the config as stored at commit time: `nodes` leave its
    /// server list and its map, if any, is repaired; other fields are kept.
    /// Returns the saved config and the vbuckets left without a copy.
    async fn save_bucket(
        &self,
        bucket: &str,
        nodes: &BTreeSet<NodeId>,
        seqnos: Option<&VbucketSeqnos>,
    ) -> FailoverResult<(BucketConfig, Vec<VbucketId>)> {
        let key = Key::buckets();
        self.client
            .transaction(&[key.clone()], None, |snapshot| {
                let mut buckets = match snapshot.typed(&key, Value::as_buckets, "bucket configs") {
                    Ok(buckets) => buckets.cloned().unwrap_or_default(),
                    Err(e) => return Txn::Abort(FailoverError::from(e)),
                };
                let config = match buckets.get_mut(bucket) {
                    Some(config) => config,
                    None => return Txn::Abort(bucket_failed(bucket, "bucket deleted during failover".to_string())),
                };

                let repair = match &config.map {
                    Some(map) if config.is_persistent() => Some(repair_map(map, nodes, seqnos)),
                    _ => None,
                };
                let lost = match repair {
                    Some(Ok(repaired)) => {
                        let lost = lost_vbuckets(&repaired);
                        config.map = Some(repaired);
                        lost
                    }
                    // The map changed since the seqno query
                    Some(Err(e)) => return Txn::Abort(bucket_failed(bucket, e.to_string())),
                    None => Vec::new(),
                };
                tracing::debug!("Stripping {:?} from server list of bucket {}", nodes, bucket);
                config.strip_servers(nodes);

                let saved = config.clone();
                Txn::Commit(vec![Write::Set(key.clone(), Value::Buckets(buckets))], (saved, lost))
            })
            .await?
            .into_result()
    }

    /// Fail non-KV services over one at a time and return the nodes that
    /// must stay active
    async fn failover_services(
        &self,
        view: &ClusterView,
        nodes: &BTreeSet<NodeId>,
        options: &FailoverOptions,
        report: &mut FailoverReport,
    ) -> BTreeSet<NodeId> {
        let services: BTreeSet<Service> = nodes
            .iter()
            .flat_map(|node| view.services_of(node))
            .filter(|service| *service != Service::Kv)
            .collect();

        let mut unsafe_nodes = BTreeSet::new();
        for service in services {
            let service_nodes = view.service_nodes(nodes, service);
            let rpc = &self.collaborators.service_failover;

            let statuses: BTreeMap<NodeId, Result<(), String>> = match timeout(
                self.config.service_failover_timeout(),
                rpc.complete_service_failover(service, &service_nodes),
            )
            .await
            {
                Ok(statuses) => statuses,
                Err(_) => service_nodes
                    .iter()
                    .map(|node| (node.clone(), Err("timeout".to_string())))
                    .collect(),
            };

            for (node, status) in statuses {
                if let Err(reason) = status {
                    tracing::error!("Failover of service {} on {} failed: {}", service, node, reason);
                    if options.auto {
                        unsafe_nodes.insert(node.clone());
                    }
                    report.service_errors.push(ServiceFailure { service, node, reason });
                }
            }
        }

        if !unsafe_nodes.is_empty() {
            tracing::warn!("Not deactivating {:?}: service failover failed", unsafe_nodes);
        }
        unsafe_nodes
    }
}

fn bucket_failed(bucket: &str, reason: String) -> FailoverError {
    FailoverError::BucketFailed {
        bucket: bucket.to_string(),
        reason,
    }
}

