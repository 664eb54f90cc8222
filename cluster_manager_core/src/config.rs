//! Configuration management for the cluster manager
//!
//! This module provides structured configuration using TOML/YAML files with
//! serde for serialization and deserialization.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for one cluster manager node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Node identity and cluster-wide mode switches
    pub node: NodeConfig,
    /// Topology coordinator configuration
    pub coordinator: CoordinatorConfig,
    /// Failover engine configuration
    pub failover: FailoverConfig,
    /// Quorum store client configuration
    pub store: StoreConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node ID
    pub node_id: String,
    /// Whether the consensus backend is enabled; required for quorum-loss failover
    pub consensus_enabled: bool,
    /// Pull config from peers and pick replicas by seqno during failover
    pub durability_aware: bool,
}

/// Topology coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Interval between janitor passes in seconds
    pub janitor_interval_secs: u64,
    /// Timeout of a single coordinator call in seconds
    pub call_timeout_secs: u64,
    /// Number of attempts per coordinator call
    pub call_tries: u32,
    /// Sleep between coordinator call attempts in milliseconds
    pub retry_sleep_ms: u64,
    /// How many interrupted operations a single call may recover before giving up
    pub max_recovery_attempts: u32,
}

/// Failover engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Timeout of the batched vbucket seqno query in seconds
    pub vbucket_query_timeout_secs: u64,
    /// Timeout of the config pull from peers in seconds
    pub config_sync_timeout_secs: u64,
    /// Timeout of a single service failover call in seconds
    pub service_failover_timeout_secs: u64,
    /// Timeout of each bucket janitor call in seconds
    pub janitor_timeout_secs: u64,
    /// How long a cluster-wide failover lease stays valid in seconds
    pub lease_secs: u64,
    /// How long to wait for a lease held by another node in seconds
    pub lease_wait_secs: u64,
}

/// Quorum store client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Commit attempts before a conflicting transaction is abandoned
    pub transaction_retries: u32,
    /// Capacity of the change feed buffer
    pub event_buffer: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Enable console output
    pub console: bool,
}

/// Log level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Simple text format
    Simple,
    /// JSON format
    Json,
    /// Pretty format with colors
    Pretty,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics
    pub enabled: bool,
    /// Custom labels
    pub labels: HashMap<String, String>,
}

impl ManagerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, picking the format from the file extension
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            _ => Self::from_file(path),
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save_to_yaml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node.node_id.is_empty() {
            errors.push("Node ID cannot be empty".to_string());
        }

        if self.coordinator.janitor_interval_secs == 0 {
            errors.push("Janitor interval cannot be 0".to_string());
        }
        if self.coordinator.call_timeout_secs == 0 {
            errors.push("Coordinator call timeout cannot be 0".to_string());
        }
        if self.coordinator.call_tries == 0 {
            errors.push("Coordinator call tries cannot be 0".to_string());
        }

        if self.failover.vbucket_query_timeout_secs == 0 {
            errors.push("Vbucket query timeout cannot be 0".to_string());
        }
        if self.failover.janitor_timeout_secs == 0 {
            errors.push("Janitor timeout cannot be 0".to_string());
        }
        if self.failover.lease_secs == 0 {
            errors.push("Failover lease duration cannot be 0".to_string());
        }

        if self.store.transaction_retries == 0 {
            errors.push("Transaction retries cannot be 0".to_string());
        }
        if self.store.event_buffer == 0 {
            errors.push("Event buffer cannot be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get duration for the janitor interval
    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.coordinator.janitor_interval_secs)
    }

    /// Get duration for a coordinator call
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.coordinator.call_timeout_secs)
    }

    /// Get duration between coordinator call attempts
    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.coordinator.retry_sleep_ms)
    }

    /// Get duration for the vbucket seqno query
    pub fn vbucket_query_timeout(&self) -> Duration {
        Duration::from_secs(self.failover.vbucket_query_timeout_secs)
    }

    /// Get duration for the config pull
    pub fn config_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.failover.config_sync_timeout_secs)
    }

    /// Get duration for a service failover call
    pub fn service_failover_timeout(&self) -> Duration {
        Duration::from_secs(self.failover.service_failover_timeout_secs)
    }

    /// Get duration for a bucket janitor call
    pub fn janitor_timeout(&self) -> Duration {
        Duration::from_secs(self.failover.janitor_timeout_secs)
    }

    /// Get validity of a failover lease
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.failover.lease_secs)
    }

    /// Get the longest wait for a failover lease
    pub fn lease_wait(&self) -> Duration {
        Duration::from_secs(self.failover.lease_wait_secs)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            consensus_enabled: true,
            durability_aware: true,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            janitor_interval_secs: 60,
            call_timeout_secs: 60,
            call_tries: 3,
            retry_sleep_ms: 200,
            max_recovery_attempts: 3,
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            vbucket_query_timeout_secs: 10,
            config_sync_timeout_secs: 30,
            service_failover_timeout_secs: 60,
            janitor_timeout_secs: 30,
            lease_secs: 300,
            lease_wait_secs: 60,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            transaction_retries: 10,
            event_buffer: 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Simple,
            console: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            labels: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.node.node_id, "node-1");
        assert_eq!(config.coordinator.call_tries, 3);
        assert_eq!(config.store.transaction_retries, 10);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ManagerConfig::default();
        assert!(config.validate().is_ok());

        config.coordinator.call_tries = 0;
        config.node.node_id.clear();
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&"Coordinator call tries cannot be 0".to_string()));
        assert!(errors.contains(&"Node ID cannot be empty".to_string()));
    }

    #[test]
    fn test_config_serialization() {
        let config = ManagerConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: ManagerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.coordinator.janitor_interval_secs, deserialized.coordinator.janitor_interval_secs);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ManagerConfig = toml::from_str("[node]\nnode_id = \"n2\"\n").unwrap();
        assert_eq!(config.node.node_id, "n2");
        assert!(config.node.durability_aware);
        assert_eq!(config.failover.vbucket_query_timeout_secs, 10);
    }

    #[test]
    fn test_duration_conversions() {
        let config = ManagerConfig::default();
        assert_eq!(config.janitor_interval(), Duration::from_secs(60));
        assert_eq!(config.retry_sleep(), Duration::from_millis(200));
        assert_eq!(config.vbucket_query_timeout(), Duration::from_secs(10));
        assert_eq!(config.janitor_timeout(), Duration::from_secs(30));
        assert_eq!(config.lease_duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_failover_timeouts_validated() {
        let mut config = ManagerConfig::default();
        config.failover.janitor_timeout_secs = 0;
        config.failover.lease_secs = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&"Janitor timeout cannot be 0".to_string()));
    }
}
