//! Failover engine tests
//!
//! End-to-end failovers through `ClusterManager` with scripted
//! collaborators: map repair with and without seqno-based promotion,
//! lost vbuckets, bucket and janitor failures, service failures, the
//! quorum-loss path and failovers racing each other or bucket changes.

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use cluster_manager_core::bucket::{BucketConfig, VbucketId};
use cluster_manager_core::coordinator::FailoverOpaque;
use cluster_manager_core::failover::collaborators::{
    AuditEvent, AuditSink, BucketJanitor, CleanupOutcome, Collaborators, ConfigSync, SeqnoQuery, ServiceFailoverRpc,
    StaticVbucketState, VbucketStateRpc,
};
use cluster_manager_core::failover::{BucketStatus, FailoverOptions};
use cluster_manager_core::map_repair::{SeqnoStats, VbucketSeqnos};
use cluster_manager_core::{
    BucketType, ClusterView, FailoverError, InMemoryQuorumStore, Key, ManagerConfig, Membership, NodeId, QuorumStore,
    Service, Value,
};
use tokio::sync::Barrier;

use common::{chain, node, node_set, ClusterBuilder, TestCluster};

#[derive(Default)]
struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl AuditSink for RecordingAudit {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Seqno RPC where some nodes never answer
struct UnreachableNodes(Vec<NodeId>);

#[async_trait::async_trait]
impl VbucketStateRpc for UnreachableNodes {
    async fn query_seqnos(&self, _bucket: &str, _requests: &BTreeMap<NodeId, Vec<VbucketId>>) -> SeqnoQuery {
        SeqnoQuery {
            stats: VbucketSeqnos::new(),
            failed_nodes: self.0.clone(),
        }
    }
}

/// Janitor whose cleanup fails on some nodes
struct BadNodesJanitor(Vec<NodeId>);

#[async_trait::async_trait]
impl BucketJanitor for BadNodesJanitor {
    async fn check_server_list(&self, _bucket: &BucketConfig, _view: &ClusterView) -> Result<(), String> {
        Ok(())
    }

    async fn cleanup(&self, _bucket: &BucketConfig, _failed: &BTreeSet<NodeId>) -> CleanupOutcome {
        CleanupOutcome::BadNodes(self.0.clone())
    }
}

/// Service failover that fails on one node
struct FailingServiceNode(NodeId);

#[async_trait::async_trait]
impl ServiceFailoverRpc for FailingServiceNode {
    async fn complete_service_failover(
        &self,
        _service: Service,
        nodes: &BTreeSet<NodeId>,
    ) -> BTreeMap<NodeId, Result<(), String>> {
        nodes
            .iter()
            .map(|n| {
                let status = if *n == self.0 { Err("rebalance running".to_string()) } else { Ok(()) };
                (n.clone(), status)
            })
            .collect()
    }
}

/// Config pull that holds callers until all of them arrived
struct RendezvousSync(Barrier);

#[async_trait::async_trait]
impl ConfigSync for RendezvousSync {
    async fn pull(&self, _peers: &BTreeSet<NodeId>) -> Result<(), String> {
        self.0.wait().await;
        Ok(())
    }
}

/// What a `HookedJanitor` does to the cluster from inside its calls
enum JanitorHook {
    DeleteBuckets,
    AddOverride(NodeId),
    LoseQuorum,
    HangCheck,
    HangCleanup,
}

struct HookedJanitor {
    store: Arc<InMemoryQuorumStore>,
    hook: JanitorHook,
}

#[async_trait::async_trait]
impl BucketJanitor for HookedJanitor {
    async fn check_server_list(&self, bucket: &BucketConfig, _view: &ClusterView) -> Result<(), String> {
        match &self.hook {
            JanitorHook::DeleteBuckets => self.store.force_delete(Key::buckets()).await,
            JanitorHook::AddOverride(node) => {
                let mut buckets = match self.store.get(&Key::buckets()).await.unwrap().map(|v| v.value) {
                    Some(Value::Buckets(buckets)) => buckets,
                    other => panic!("unexpected buckets value {:?}", other),
                };
                let overrides = [("threads".to_string(), "4".to_string())].into_iter().collect();
                buckets.get_mut(&bucket.name).unwrap().node_overrides.insert(node.clone(), overrides);
                self.store.force_set(Key::buckets(), Value::Buckets(buckets)).await;
            }
            JanitorHook::LoseQuorum => self.store.set_quorum_lost(true).await,
            JanitorHook::HangCheck => std::future::pending::<()>().await,
            JanitorHook::HangCleanup => {}
        }
        Ok(())
    }

    async fn cleanup(&self, _bucket: &BucketConfig, _failed: &BTreeSet<NodeId>) -> CleanupOutcome {
        if let JanitorHook::HangCleanup = self.hook {
            std::future::pending::<()>().await;
        }
        CleanupOutcome::Ok
    }
}

/// Cluster of kv nodes a, b and c led by a, with a hooked janitor and one
/// bucket whose first vbucket is mastered on c
async fn hooked_cluster(hook: JanitorHook, configure: impl Fn(&mut ManagerConfig) + 'static) -> TestCluster {
    let builder = ClusterBuilder::kv_nodes(&["a", "b", "c"]).configure(configure);
    let collaborators = Collaborators {
        bucket_janitor: Arc::new(HookedJanitor {
            store: builder.store(),
            hook,
        }),
        ..Collaborators::local()
    };
    let cluster = builder.with_collaborators(collaborators).start().await;
    cluster
        .put_buckets(vec![bucket(
            "default",
            1,
            &["a", "b", "c"],
            vec![chain(&["c", "a"]), chain(&["a", "b"])],
        )])
        .await;
    cluster
}

fn bucket(name: &str, replicas: usize, servers: &[&str], map: Vec<Vec<Option<NodeId>>>) -> BucketConfig {
    BucketConfig::new(name, BucketType::Couchstore, replicas)
        .with_servers(servers.iter().map(|n| node(n)))
        .with_map(map)
}

fn failover_vbuckets(entries: &[(&str, &[VbucketId])]) -> Value {
    Value::FailoverVbuckets(
        entries
            .iter()
            .map(|(bucket, vbs)| (bucket.to_string(), vbs.iter().copied().collect()))
            .collect(),
    )
}

#[tokio::test]
async fn test_failover_repairs_map_and_deactivates_nodes() {
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c", "d"]).running(&["c"]).start().await;
    cluster
        .put_buckets(vec![bucket(
            "default",
            2,
            &["a", "b", "c", "d"],
            vec![chain(&["a", "b", "c"]), chain(&["b", "c", "d"]), chain(&["a", "c", "d"])],
        )])
        .await;

    let report = cluster
        .leader()
        .failover(node_set(&["a", "b"]), FailoverOptions::manual())
        .await
        .unwrap();

    let repaired = cluster.bucket("default").await;
    assert_eq!(
        repaired.map,
        Some(vec![chain(&["c", "_", "_"]), chain(&["c", "d", "_"]), chain(&["c", "d", "_"])])
    );
    assert_eq!(repaired.servers, vec![node("c"), node("d")]);

    assert!(report.buckets["default"].lost_vbuckets.is_empty());
    assert_eq!(report.buckets["default"].status, BucketStatus::Ok);
    assert_eq!(report.deactivated, node_set(&["a", "b"]));
    assert!(report.finished_at.is_some());

    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("a")), Membership::InactiveFailed);
    assert_eq!(view.membership_of(&node("b")), Membership::InactiveFailed);

    assert_eq!(
        cluster.get(&Key::node_failover_vbuckets(&node("a"))).await,
        Some(failover_vbuckets(&[("default", &[0, 2])]))
    );
    assert_eq!(
        cluster.get(&Key::node_failover_vbuckets(&node("b"))).await,
        Some(failover_vbuckets(&[("default", &[1])]))
    );

    let metrics = cluster.leader().metrics().snapshot();
    assert_eq!(metrics.failovers_succeeded, 1);
    assert_eq!(metrics.nodes_failed_over, 2);

    cluster.stop().await;
}

#[tokio::test]
async fn test_lost_vbuckets_are_reported_and_audited() {
    let audit = Arc::new(RecordingAudit::default());
    let collaborators = Collaborators {
        audit: audit.clone(),
        ..Collaborators::local()
    };
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c", "d"])
        .running(&["c"])
        .with_collaborators(collaborators)
        .start()
        .await;
    cluster
        .put_buckets(vec![bucket(
            "default",
            1,
            &["a", "b", "c", "d"],
            vec![chain(&["a", "b"]), chain(&["c", "d"])],
        )])
        .await;

    let report = cluster
        .leader()
        .failover(node_set(&["a", "b"]), FailoverOptions::manual())
        .await
        .unwrap();

    assert_eq!(report.buckets["default"].lost_vbuckets, vec![0]);
    assert_eq!(cluster.leader().metrics().snapshot().lost_vbuckets, 1);

    let events = audit.events.lock().unwrap().clone();
    assert!(matches!(events.first(), Some(AuditEvent::FailoverStarted { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        AuditEvent::DataLost { bucket, percentage, .. } if bucket == "default" && *percentage == 50.0
    )));
    assert!(matches!(
        events.last(),
        Some(AuditEvent::FailoverEnded { success: true, .. })
    ));

    cluster.stop().await;
}

#[tokio::test]
async fn test_durability_aware_failover_promotes_most_recent_replica() {
    let mut per_node = BTreeMap::new();
    per_node.insert(node("b"), SeqnoStats::new(3, 9));
    per_node.insert(node("c"), SeqnoStats::new(5, 0));
    let stats: BTreeMap<String, VbucketSeqnos> = [("default".to_string(), [(0usize, per_node)].into_iter().collect())]
        .into_iter()
        .collect();

    let collaborators = Collaborators {
        vbucket_state: Arc::new(StaticVbucketState::new(stats)),
        ..Collaborators::local()
    };
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c"])
        .running(&["b"])
        .with_collaborators(collaborators)
        .configure(|config| config.node.durability_aware = true)
        .start()
        .await;
    cluster
        .put_buckets(vec![bucket(
            "default",
            2,
            &["a", "b", "c"],
            vec![chain(&["a", "b", "c"]), chain(&["b", "a", "c"])],
        )])
        .await;

    cluster
        .leader()
        .failover(node_set(&["a"]), FailoverOptions::manual())
        .await
        .unwrap();

    let repaired = cluster.bucket("default").await;
    assert_eq!(
        repaired.map,
        Some(vec![chain(&["c", "b", "_"]), chain(&["b", "c", "_"])])
    );

    cluster.stop().await;
}

#[tokio::test]
async fn test_unreachable_seqno_node_aborts_and_keeps_partial_results() {
    let collaborators = Collaborators {
        vbucket_state: Arc::new(UnreachableNodes(vec![node("c")])),
        ..Collaborators::local()
    };
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c"])
        .running(&["b"])
        .with_collaborators(collaborators)
        .configure(|config| config.node.durability_aware = true)
        .start()
        .await;
    cluster
        .put_buckets(vec![
            // Single surviving replica, no seqno query needed
            bucket("alpha", 1, &["a", "b"], vec![chain(&["a", "b"])]),
            bucket("beta", 2, &["a", "b", "c"], vec![chain(&["a", "b", "c"])]),
        ])
        .await;

    let result = cluster
        .leader()
        .failover(node_set(&["a"]), FailoverOptions::manual())
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.code(), "failed");
    assert!(matches!(&err, FailoverError::BucketFailed { bucket, .. } if bucket == "beta"));

    assert_eq!(cluster.bucket("alpha").await.map, Some(vec![chain(&["b", "_"])]));
    assert_eq!(cluster.bucket("beta").await.map, Some(vec![chain(&["a", "b", "c"])]));

    match cluster.get(&Key::node_failover_vbuckets(&node("a"))).await {
        Some(Value::FailoverVbuckets(recorded)) => assert!(recorded.contains_key("alpha")),
        other => panic!("failover vbuckets not persisted: {:?}", other),
    }

    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("a")), Membership::Active);
    assert_eq!(cluster.leader().metrics().snapshot().failovers_failed, 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_inconsistent_server_list_aborts_failover() {
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c"]).start().await;
    cluster
        .put_buckets(vec![bucket("default", 1, &["a", "b", "zzz"], vec![chain(&["b", "a"])])])
        .await;

    let result = cluster
        .leader()
        .failover(node_set(&["b"]), FailoverOptions::manual())
        .await;
    assert!(matches!(result, Err(FailoverError::BucketFailed { .. })));

    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("b")), Membership::Active);

    cluster.stop().await;
}

#[tokio::test]
async fn test_janitor_failure_is_reported_but_not_fatal() {
    let collaborators = Collaborators {
        bucket_janitor: Arc::new(BadNodesJanitor(vec![node("c")])),
        ..Collaborators::local()
    };
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c"])
        .with_collaborators(collaborators)
        .start()
        .await;
    cluster
        .put_buckets(vec![
            bucket("default", 1, &["a", "b", "c"], vec![chain(&["b", "c"]), chain(&["c", "a"])]),
            BucketConfig::new("cache", BucketType::Memcached, 0).with_servers([node("a"), node("b"), node("c")]),
        ])
        .await;

    let report = cluster
        .leader()
        .failover(node_set(&["b"]), FailoverOptions::manual())
        .await
        .unwrap();

    assert_eq!(report.janitor_failures(), vec!["default"]);
    assert_eq!(
        report.buckets["default"].status,
        BucketStatus::JanitorFailed {
            bad_nodes: vec![node("c")]
        }
    );
    assert_eq!(report.buckets["cache"].status, BucketStatus::Ok);
    assert_eq!(cluster.bucket("cache").await.servers, vec![node("a"), node("c")]);
    assert_eq!(report.deactivated, node_set(&["b"]));

    cluster.stop().await;
}

#[tokio::test]
async fn test_feasibility_errors() {
    let cluster = ClusterBuilder::kv_nodes(&["a", "b"])
        .with_services("c", &[Service::Index])
        .start()
        .await;
    let manager = cluster.leader();

    let result = manager.failover(node_set(&["a", "b"]), FailoverOptions::manual()).await;
    assert_eq!(result.unwrap_err(), FailoverError::LastNode);

    let result = manager.failover(node_set(&["zzz"]), FailoverOptions::manual()).await;
    assert_eq!(result.unwrap_err(), FailoverError::UnknownNode(node("zzz")));

    let result = manager.failover(BTreeSet::new(), FailoverOptions::manual()).await;
    assert_eq!(result.unwrap_err(), FailoverError::NoNodes);

    manager.failover(node_set(&["b"]), FailoverOptions::manual()).await.unwrap();
    let result = manager.failover(node_set(&["b"]), FailoverOptions::manual()).await;
    assert_eq!(result.unwrap_err(), FailoverError::InactiveNode(node("b")));

    cluster.stop().await;
}

#[tokio::test]
async fn test_auto_failover_keeps_nodes_whose_services_failed() {
    let collaborators = Collaborators {
        service_failover: Arc::new(FailingServiceNode(node("c"))),
        ..Collaborators::local()
    };
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c"])
        .with_services("c", &[Service::Kv, Service::Index])
        .with_collaborators(collaborators)
        .start()
        .await;

    let report = cluster
        .leader()
        .failover(node_set(&["b", "c"]), FailoverOptions::auto())
        .await
        .unwrap();

    assert_eq!(report.unsafe_nodes, node_set(&["c"]));
    assert_eq!(report.deactivated, node_set(&["b"]));
    assert_eq!(report.service_errors.len(), 1);
    assert_eq!(report.service_errors[0].service, Service::Index);

    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("b")), Membership::InactiveFailed);
    assert_eq!(view.membership_of(&node("c")), Membership::Active);

    // A manual failover reports the error but still deactivates
    let report = cluster
        .leader()
        .failover(node_set(&["c"]), FailoverOptions::manual())
        .await
        .unwrap();
    assert!(report.unsafe_nodes.is_empty());
    assert_eq!(report.service_errors.len(), 1);
    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("c")), Membership::InactiveFailed);

    cluster.stop().await;
}

#[tokio::test]
async fn test_quorum_loss_failover() {
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c"]).start().await;
    cluster.store.set_quorum_lost(true).await;

    let result = cluster
        .leader()
        .failover(node_set(&["b", "c"]), FailoverOptions::manual())
        .await;
    assert_eq!(result.unwrap_err(), FailoverError::OrchestrationUnsafe);

    let report = cluster
        .leader()
        .failover(node_set(&["b", "c"]), FailoverOptions::unsafe_failover())
        .await
        .unwrap();

    let reference = report.failover_ref.clone().unwrap();
    assert_eq!(reference.len(), 32);
    assert_eq!(report.deactivated, node_set(&["b", "c"]));

    assert!(cluster.store.has_quorum().await);
    assert_eq!(cluster.store.peers().await.keys().cloned().collect::<BTreeSet<_>>(), node_set(&["a"]));
    assert_eq!(cluster.get(&Key::failover_opaque()).await, None);

    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("b")), Membership::InactiveFailed);
    assert_eq!(view.membership_of(&node("c")), Membership::InactiveFailed);

    cluster.stop().await;
}

#[tokio::test]
async fn test_unfinished_failover_blocks_new_ones() {
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c", "d"]).start().await;
    let opaque = FailoverOpaque {
        reference: "old".to_string(),
        nodes: node_set(&["c", "d"]),
    };
    cluster.store.force_set(Key::failover_opaque(), opaque.into()).await;

    let result = cluster
        .leader()
        .failover(node_set(&["b"]), FailoverOptions::manual())
        .await;
    assert_eq!(result.unwrap_err(), FailoverError::OrchestrationUnsafe);

    let err = cluster
        .leader()
        .failover(node_set(&["c"]), FailoverOptions::unsafe_failover())
        .await
        .unwrap_err();
    assert_eq!(err, FailoverError::IncompatibleWithPrevious);
    assert_eq!(err.code(), "incompatible_with_previous");

    cluster.stop().await;
}

#[tokio::test]
async fn test_durability_majority_check() {
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c"]).start().await;
    cluster
        .put_buckets(vec![bucket("default", 2, &["a", "b", "c"], vec![chain(&["a", "b", "c"])])])
        .await;

    let engine = cluster.leader().failover_engine();
    assert!(engine.preserves_durability_majority(&node_set(&["a"])).await.unwrap());
    assert!(!engine.preserves_durability_majority(&node_set(&["a", "b"])).await.unwrap());

    cluster.stop().await;
}

#[tokio::test]
async fn test_concurrent_failovers_run_one_at_a_time() {
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c", "d"]).start().await;
    cluster
        .put_buckets(vec![bucket(
            "default",
            1,
            &["a", "b", "c", "d"],
            vec![chain(&["b", "a"]), chain(&["c", "d"]), chain(&["d", "b"])],
        )])
        .await;

    let engine = cluster.leader().failover_engine();
    let (first, second) = futures::join!(
        engine.failover(node_set(&["b"]), FailoverOptions::manual()),
        engine.failover(node_set(&["c"]), FailoverOptions::manual()),
    );
    first.unwrap();
    second.unwrap();

    // Each repair saw the other's result instead of overwriting it
    assert_eq!(
        cluster.bucket("default").await.map,
        Some(vec![chain(&["a", "_"]), chain(&["d", "_"]), chain(&["d", "_"])])
    );
    assert_eq!(cluster.bucket("default").await.servers, vec![node("a"), node("d")]);

    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("b")), Membership::InactiveFailed);
    assert_eq!(view.membership_of(&node("c")), Membership::InactiveFailed);

    cluster.stop().await;
}

#[tokio::test]
async fn test_failovers_started_on_two_nodes_keep_one_kv_node() {
    let collaborators = Collaborators {
        config_sync: Arc::new(RendezvousSync(Barrier::new(2))),
        ..Collaborators::local()
    };
    let cluster = ClusterBuilder::kv_nodes(&["a", "b"])
        .with_services("c", &[Service::Index])
        .running(&["c", "a", "b"])
        .with_collaborators(collaborators)
        .configure(|config| config.node.durability_aware = true)
        .start()
        .await;

    let (a_result, b_result) = futures::join!(
        cluster.manager("a").failover(node_set(&["b"]), FailoverOptions::manual()),
        cluster.manager("b").failover(node_set(&["a"]), FailoverOptions::manual()),
    );

    let (survivor, refused) = match (&a_result, &b_result) {
        (Ok(_), Err(e)) => ("a", e),
        (Err(e), Ok(_)) => ("b", e),
        other => panic!("expected exactly one failover to succeed: {:?}", other),
    };
    assert_eq!(refused, &FailoverError::LastNode);

    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.active_service_nodes(Service::Kv), node_set(&[survivor]));
    assert_eq!(cluster.get(&Key::topology_operation()).await, None);
    assert_eq!(cluster.get(&Key::failover_lease()).await, None);

    cluster.stop().await;
}

#[tokio::test]
async fn test_incomplete_seqno_answer_aborts_failover() {
    let mut per_node = BTreeMap::new();
    per_node.insert(node("b"), SeqnoStats::new(1, 0));
    let stats: BTreeMap<String, VbucketSeqnos> = [("default".to_string(), [(0, per_node)].into_iter().collect())]
        .into_iter()
        .collect();

    let collaborators = Collaborators {
        vbucket_state: Arc::new(StaticVbucketState::new(stats)),
        ..Collaborators::local()
    };
    let cluster = ClusterBuilder::kv_nodes(&["a", "b", "c"])
        .running(&["b"])
        .with_collaborators(collaborators)
        .configure(|config| config.node.durability_aware = true)
        .start()
        .await;
    cluster
        .put_buckets(vec![bucket("default", 2, &["a", "b", "c"], vec![chain(&["a", "c", "b"])])])
        .await;

    let result = cluster
        .leader()
        .failover(node_set(&["a"]), FailoverOptions::manual())
        .await;

    let err = result.unwrap_err();
    assert!(matches!(&err, FailoverError::BucketFailed { bucket, .. } if bucket == "default"));
    assert_eq!(cluster.bucket("default").await.map, Some(vec![chain(&["a", "c", "b"])]));

    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("a")), Membership::Active);

    cluster.stop().await;
}

#[tokio::test]
async fn test_bucket_deleted_during_failover_stays_deleted() {
    let cluster = hooked_cluster(JanitorHook::DeleteBuckets, |_| {}).await;

    let err = cluster
        .leader()
        .failover(node_set(&["c"]), FailoverOptions::manual())
        .await
        .unwrap_err();
    assert!(matches!(&err, FailoverError::BucketFailed { bucket, .. } if bucket == "default"));
    assert_eq!(cluster.get(&Key::buckets()).await, None);

    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("c")), Membership::Active);

    cluster.stop().await;
}

#[tokio::test]
async fn test_failover_keeps_concurrent_bucket_changes() {
    let cluster = hooked_cluster(JanitorHook::AddOverride(node("a")), |_| {}).await;

    cluster
        .leader()
        .failover(node_set(&["c"]), FailoverOptions::manual())
        .await
        .unwrap();

    let saved = cluster.bucket("default").await;
    assert_eq!(saved.node_overrides[&node("a")]["threads"], "4");
    assert_eq!(saved.map, Some(vec![chain(&["a", "_"]), chain(&["a", "b"])]));
    assert_eq!(saved.servers, vec![node("a"), node("b")]);

    cluster.stop().await;
}

#[tokio::test]
async fn test_quorum_lost_mid_failover() {
    let cluster = hooked_cluster(JanitorHook::LoseQuorum, |_| {}).await;

    let err = cluster
        .leader()
        .failover(node_set(&["c"]), FailoverOptions::manual())
        .await
        .unwrap_err();
    assert_eq!(err, FailoverError::QuorumLost);
    assert_eq!(err.code(), "quorum_lost");

    cluster.store.set_quorum_lost(false).await;
    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("c")), Membership::Active);
    assert_eq!(cluster.bucket("default").await.map, Some(vec![chain(&["c", "a"]), chain(&["a", "b"])]));

    cluster.stop().await;
}

#[tokio::test]
async fn test_hanging_server_list_check_times_out() {
    let cluster = hooked_cluster(JanitorHook::HangCheck, |config| config.failover.janitor_timeout_secs = 1).await;

    let err = cluster
        .leader()
        .failover(node_set(&["c"]), FailoverOptions::manual())
        .await
        .unwrap_err();
    assert!(matches!(&err, FailoverError::BucketFailed { reason, .. } if reason.contains("timed out")));
    assert_eq!(cluster.bucket("default").await.map, Some(vec![chain(&["c", "a"]), chain(&["a", "b"])]));

    cluster.stop().await;
}

#[tokio::test]
async fn test_hanging_cleanup_is_reported_as_janitor_failure() {
    let cluster = hooked_cluster(JanitorHook::HangCleanup, |config| config.failover.janitor_timeout_secs = 1).await;

    let report = cluster
        .leader()
        .failover(node_set(&["c"]), FailoverOptions::manual())
        .await
        .unwrap();

    assert_eq!(
        report.buckets["default"].status,
        BucketStatus::JanitorFailed { bad_nodes: Vec::new() }
    );
    assert_eq!(cluster.bucket("default").await.map, Some(vec![chain(&["a", "_"]), chain(&["a", "b"])]));
    let view = cluster.leader().view().await.unwrap();
    assert_eq!(view.membership_of(&node("c")), Membership::InactiveFailed);

    cluster.stop().await;
}
