//! Metrics collection for the cluster manager
//!
//! Counters are kept as atomics for in-process inspection and mirrored to
//! the `metrics` crate facade so any installed exporter can scrape them.

use crate::config::MetricsConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics collector for the control plane
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    failover: FailoverMetrics,
    topology: TopologyMetrics,
    store: StoreMetrics,
    startup_time: Instant,
}

/// Failover-related metrics
#[derive(Debug, Default)]
pub struct FailoverMetrics {
    pub started: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub nodes_failed_over: AtomicU64,
    pub lost_vbuckets: AtomicU64,
    pub janitor_failures: AtomicU64,
}

/// Topology coordinator metrics
#[derive(Debug, Default)]
pub struct TopologyMetrics {
    pub operations: AtomicU64,
    pub operation_errors: AtomicU64,
    pub recoveries: AtomicU64,
    pub janitor_runs: AtomicU64,
    pub delegations: AtomicU64,
}

/// Quorum store client metrics
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub transaction_retries: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new(config: MetricsConfig) -> Self {
        let collector = Self {
            config,
            failover: FailoverMetrics::default(),
            topology: TopologyMetrics::default(),
            store: StoreMetrics::default(),
            startup_time: Instant::now(),
        };
        collector.initialize_metrics();
        collector
    }

    /// Initialize metrics with custom labels
    fn initialize_metrics(&self) {
        if !self.config.enabled {
            return;
        }
        for (key, value) in &self.config.labels {
            metrics::gauge!("cluster_manager_labels", 1.0, "key" => key.clone(), "value" => value.clone());
        }
    }

    /// Record the start of a failover
    pub fn record_failover_started(&self, nodes: usize) {
        self.failover.started.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cluster_manager_failovers_started_total", 1);
            metrics::gauge!("cluster_manager_failover_nodes", nodes as f64);
        }
    }

    /// Record the end of a failover
    pub fn record_failover_finished(&self, success: bool, nodes: usize, duration: Duration) {
        if success {
            self.failover.succeeded.fetch_add(1, Ordering::Relaxed);
            self.failover.nodes_failed_over.fetch_add(nodes as u64, Ordering::Relaxed);
        } else {
            self.failover.failed.fetch_add(1, Ordering::Relaxed);
        }

        if self.config.enabled {
            let outcome = if success { "success" } else { "error" };
            metrics::counter!("cluster_manager_failovers_total", 1, "outcome" => outcome);
            metrics::histogram!("cluster_manager_failover_duration_ms", duration.as_millis() as f64);
        }
    }

    /// Record vbuckets that lost their last live copy
    pub fn record_lost_vbuckets(&self, bucket: &str, count: usize) {
        self.failover.lost_vbuckets.fetch_add(count as u64, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cluster_manager_lost_vbuckets_total", count as u64, "bucket" => bucket.to_string());
        }
    }

    /// Record a bucket whose janitor cleanup failed after failover
    pub fn record_janitor_failure(&self, bucket: &str) {
        self.failover.janitor_failures.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cluster_manager_bucket_janitor_failures_total", 1, "bucket" => bucket.to_string());
        }
    }

    /// Record a topology operation
    pub fn record_topology_operation(&self, operation: &str, success: bool, duration: Duration) {
        self.topology.operations.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.topology.operation_errors.fetch_add(1, Ordering::Relaxed);
        }

        if self.config.enabled {
            metrics::counter!("cluster_manager_topology_operations_total", 1, "operation" => operation.to_string());
            if !success {
                metrics::counter!("cluster_manager_topology_errors_total", 1, "operation" => operation.to_string());
            }
            metrics::histogram!("cluster_manager_topology_operation_duration_ms", duration.as_millis() as f64);
        }
    }

    /// Record the recovery of an interrupted operation
    pub fn record_recovery(&self, operation: &str) {
        self.topology.recoveries.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cluster_manager_recoveries_total", 1, "operation" => operation.to_string());
        }
    }

    /// Record a janitor pass
    pub fn record_janitor_run(&self) {
        self.topology.janitor_runs.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cluster_manager_janitor_runs_total", 1);
        }
    }

    /// Record a hand-off of an operation to the next leader
    pub fn record_delegation(&self) {
        self.topology.delegations.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cluster_manager_delegations_total", 1);
        }
    }

    /// Record a conflicting commit that was retried
    pub fn record_transaction_retry(&self) {
        self.store.transaction_retries.fetch_add(1, Ordering::Relaxed);
        if self.config.enabled {
            metrics::counter!("cluster_manager_transaction_retries_total", 1);
        }
    }

    /// Get all metrics as a structured format
    pub fn snapshot(&self) -> MetricsSummary {
        MetricsSummary {
            uptime_seconds: self.startup_time.elapsed().as_secs(),
            failovers_started: self.failover.started.load(Ordering::Relaxed),
            failovers_succeeded: self.failover.succeeded.load(Ordering::Relaxed),
            failovers_failed: self.failover.failed.load(Ordering::Relaxed),
            nodes_failed_over: self.failover.nodes_failed_over.load(Ordering::Relaxed),
            lost_vbuckets: self.failover.lost_vbuckets.load(Ordering::Relaxed),
            bucket_janitor_failures: self.failover.janitor_failures.load(Ordering::Relaxed),
            topology_operations: self.topology.operations.load(Ordering::Relaxed),
            topology_errors: self.topology.operation_errors.load(Ordering::Relaxed),
            recoveries: self.topology.recoveries.load(Ordering::Relaxed),
            janitor_runs: self.topology.janitor_runs.load(Ordering::Relaxed),
            delegations: self.topology.delegations.load(Ordering::Relaxed),
            transaction_retries: self.store.transaction_retries.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

/// Summary of all metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub uptime_seconds: u64,
    pub failovers_started: u64,
    pub failovers_succeeded: u64,
    pub failovers_failed: u64,
    pub nodes_failed_over: u64,
    pub lost_vbuckets: u64,
    pub bucket_janitor_failures: u64,
    pub topology_operations: u64,
    pub topology_errors: u64,
    pub recoveries: u64,
    pub janitor_runs: u64,
    pub delegations: u64,
    pub transaction_retries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new(MetricsConfig::default());
        let summary = collector.snapshot();
        assert_eq!(summary.failovers_started, 0);
        assert_eq!(summary.transaction_retries, 0);
    }

    #[test]
    fn test_failover_recording() {
        let collector = MetricsCollector::default();
        collector.record_failover_started(2);
        collector.record_failover_finished(true, 2, Duration::from_millis(10));
        collector.record_failover_started(1);
        collector.record_failover_finished(false, 1, Duration::from_millis(3));
        collector.record_lost_vbuckets("default", 4);

        let summary = collector.snapshot();
        assert_eq!(summary.failovers_started, 2);
        assert_eq!(summary.failovers_succeeded, 1);
        assert_eq!(summary.failovers_failed, 1);
        assert_eq!(summary.nodes_failed_over, 2);
        assert_eq!(summary.lost_vbuckets, 4);
    }

    #[test]
    fn test_topology_recording() {
        let collector = MetricsCollector::new(MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        });
        collector.record_topology_operation("add_replica", false, Duration::from_millis(5));
        collector.record_recovery("remove_peer");
        collector.record_janitor_run();

        let summary = collector.snapshot();
        assert_eq!(summary.topology_operations, 1);
        assert_eq!(summary.topology_errors, 1);
        assert_eq!(summary.recoveries, 1);
        assert_eq!(summary.janitor_runs, 1);
    }
}
