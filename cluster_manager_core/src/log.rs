//! Structured logging for the cluster manager
//!
//! This module provides structured logging using the `tracing` crate with
//! console output in plain, pretty or JSON form.

use crate::config::{LogFormat, LogLevel, LoggingConfig, ManagerConfig};
use crate::membership::NodeId;
use std::sync::Once;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::fmt::{format::FmtSpan, time::UtcTime};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_logging_inner(config);
    });
    result
}

fn init_logging_inner(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !config.console {
        return Ok(());
    }

    let level = convert_log_level(&config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(UtcTime::rfc_3339())
        .with_env_filter(filter);

    // try_init fails when another subscriber is already installed, e.g. in tests
    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Simple => builder.try_init(),
    };
    if let Err(e) = installed {
        return Err(e.to_string().into());
    }

    tracing::info!("Logging system initialized with level: {:?}", config.level);
    Ok(())
}

/// Convert our log level to tracing level
fn convert_log_level(level: &LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

fn join_nodes<'a>(nodes: impl IntoIterator<Item = &'a NodeId>) -> String {
    nodes.into_iter().map(NodeId::as_str).collect::<Vec<_>>().join(",")
}

/// Log a topology operation with structured fields
pub fn log_topology_operation(operation: &str, node_id: &NodeId, success: bool, duration: Duration) {
    let span = tracing::info_span!(
        "topology_operation",
        operation = operation,
        node_id = node_id.as_str(),
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    if success {
        tracing::info!("Topology operation completed successfully");
    } else {
        tracing::error!("Topology operation failed");
    }
}

/// Log a failover with structured fields
pub fn log_failover_operation<'a>(
    nodes: impl IntoIterator<Item = &'a NodeId>,
    success: bool,
    duration: Duration,
    additional_fields: Option<Vec<(&str, String)>>,
) {
    let span = tracing::info_span!(
        "failover_operation",
        nodes = join_nodes(nodes).as_str(),
        success = success,
        duration_ms = duration.as_millis() as u64,
        outcome = tracing::field::Empty,
        reference = tracing::field::Empty,
    );

    if let Some(fields) = additional_fields {
        for (name, value) in fields {
            span.record(name, value.as_str());
        }
    }

    let _enter = span.enter();

    if success {
        tracing::info!("Failover completed successfully");
    } else {
        tracing::error!("Failover failed");
    }
}

/// Log the outcome of a janitor pass
pub fn log_janitor_run(node_id: &NodeId, outcome: &str) {
    let span = tracing::debug_span!("janitor_run", node_id = node_id.as_str(), outcome = outcome);
    let _enter = span.enter();
    tracing::debug!("Janitor pass finished");
}

/// Log system startup
pub fn log_startup(config: &ManagerConfig) {
    tracing::info!("Starting cluster manager node {}", config.node.node_id);
    tracing::info!(
        "Janitor interval {}s, coordinator call timeout {}s",
        config.coordinator.janitor_interval_secs,
        config.coordinator.call_timeout_secs
    );

    if config.node.consensus_enabled {
        tracing::info!("Consensus backend enabled, quorum-loss failover available");
    }

    if config.node.durability_aware {
        tracing::info!("Durability-aware failover enabled");
    }

    if config.metrics.enabled {
        tracing::info!("Metrics enabled");
    }
}

/// Log system shutdown
pub fn log_shutdown(reason: &str) {
    tracing::info!("Shutting down cluster manager: {}", reason);
}
