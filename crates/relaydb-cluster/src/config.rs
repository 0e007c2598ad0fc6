//! Static cluster topology and tunables.
//!
//! The node set is fixed at startup; every node loads the same JSON file
//! and selects its own entry by id.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

/// Unique, totally ordered node identifier. Id 0 is reserved for clients.
pub type NodeId = u32;

/// One node in the static topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
}

impl NodeDescriptor {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// How the coordinator picks a read target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
}

/// Backend pool settings carried per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_pool_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            pool_size: default_pool_size(),
            acquire_timeout_ms: default_pool_acquire_timeout_ms(),
        }
    }
}

/// Full configuration for one middleware node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's id; set from the command line, not the topology file.
    #[serde(default)]
    pub node_id: NodeId,
    pub nodes: Vec<NodeDescriptor>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_prepare_timeout_ms")]
    pub prepare_timeout_ms: u64,
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
    #[serde(default = "default_coordinator_wait_ms")]
    pub coordinator_wait_ms: u64,
    #[serde(default = "default_txn_phase_timeout_ms")]
    pub txn_phase_timeout_ms: u64,
    #[serde(default = "default_client_reply_timeout_ms")]
    pub client_reply_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default)]
    pub read_strategy: ReadStrategy,
    #[serde(default)]
    pub backend: BackendSettings,
}

impl ClusterConfig {
    /// Load the topology file and bind it to `node_id`.
    pub fn load(path: &Path, node_id: NodeId) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: ClusterConfig =
            serde_json::from_str(&raw).map_err(|e| ClusterError::Config(e.to_string()))?;
        config.node_id = node_id;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ClusterError::Config("empty node set".to_string()));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id == 0 {
                return Err(ClusterError::Config("node id 0 is reserved".to_string()));
            }
            if self.nodes[..i].iter().any(|n| n.id == node.id) {
                return Err(ClusterError::Config(format!("duplicate node id {}", node.id)));
            }
        }
        if self.node(self.node_id).is_none() {
            return Err(ClusterError::Config(format!(
                "node {} not in topology",
                self.node_id
            )));
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn local(&self) -> &NodeDescriptor {
        // validated at load time
        self.nodes
            .iter()
            .find(|n| n.id == self.node_id)
            .expect("local node present in validated topology")
    }

    pub fn peers(&self) -> Vec<&NodeDescriptor> {
        self.nodes.iter().filter(|n| n.id != self.node_id).collect()
    }

    pub fn cluster_size(&self) -> usize {
        self.nodes.len()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn coordinator_wait(&self) -> Duration {
        Duration::from_millis(self.coordinator_wait_ms)
    }

    pub fn txn_phase_timeout(&self) -> Duration {
        Duration::from_millis(self.txn_phase_timeout_ms)
    }

    pub fn client_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.client_reply_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

fn default_pool_size() -> usize {
    5
}
fn default_pool_acquire_timeout_ms() -> u64 {
    30_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}
fn default_lock_timeout_ms() -> u64 {
    30_000
}
fn default_prepare_timeout_ms() -> u64 {
    30_000
}
fn default_election_timeout_ms() -> u64 {
    5_000
}
fn default_coordinator_wait_ms() -> u64 {
    10_000
}
fn default_txn_phase_timeout_ms() -> u64 {
    60_000
}
fn default_client_reply_timeout_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    3_000
}
fn default_ack_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn three_nodes() -> Vec<NodeDescriptor> {
        (1..=3)
            .map(|id| NodeDescriptor {
                id,
                address: "127.0.0.1".to_string(),
                port: 7000 + id as u16,
            })
            .collect()
    }

    #[test]
    fn test_load_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"nodes": [
                {{"id": 1, "address": "127.0.0.1", "port": 7001}},
                {{"id": 2, "address": "127.0.0.1", "port": 7002}}
            ]}}"#
        )
        .unwrap();
        let config = ClusterConfig::load(file.path(), 2).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.cluster_size(), 2);
        assert_eq!(config.heartbeat_interval_ms, 5_000);
        assert_eq!(config.heartbeat_timeout_ms, 15_000);
        assert_eq!(config.read_strategy, ReadStrategy::RoundRobin);
        assert_eq!(config.backend.pool_size, 5);
        assert_eq!(config.local().port, 7002);
        assert_eq!(config.peers().len(), 1);
    }

    #[test]
    fn test_validate_rejects_unknown_and_duplicate_ids() {
        let mut config = ClusterConfig {
            node_id: 9,
            nodes: three_nodes(),
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            lock_timeout_ms: 30_000,
            prepare_timeout_ms: 30_000,
            election_timeout_ms: 5_000,
            coordinator_wait_ms: 10_000,
            txn_phase_timeout_ms: 60_000,
            client_reply_timeout_ms: 30_000,
            connect_timeout_ms: 3_000,
            ack_timeout_ms: 5_000,
            read_strategy: ReadStrategy::RoundRobin,
            backend: BackendSettings::default(),
        };
        assert!(config.validate().is_err());

        config.node_id = 1;
        assert!(config.validate().is_ok());

        config.nodes.push(NodeDescriptor {
            id: 2,
            address: "127.0.0.1".to_string(),
            port: 7009,
        });
        assert!(config.validate().is_err());
    }
}
