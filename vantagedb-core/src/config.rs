//! Configuration management for all VantageDB subsystems.
//!
//! One root structure aggregates a section per subsystem. Each section has
//! sensible defaults so a node can start with an empty config file; the
//! whole tree serializes to JSON for persistence and sharing between nodes.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Root configuration for a VantageDB node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VantageConfig {
    /// Node identity and network binding
    pub node: NodeConfig,
    /// VP-tree partitioning and distance weighting
    pub index: IndexConfig,
    /// Replica placement and task processing
    pub replication: ReplicationConfig,
    /// Load monitoring and migration batching
    pub rebalance: RebalanceConfig,
    /// Heartbeat thresholds and recovery timing
    pub recovery: RecoveryConfig,
    /// Bootstrap, adaptive sizing and election
    pub cluster: ClusterConfig,
}

/// Node identity within the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier for this node; lexicographic order matters for
    /// election and tie-breaking, so keep ids comparable across the cluster
    pub node_id: String,
    /// Address advertised to peers
    pub address: String,
    /// Directory for snapshot persistence
    pub data_dir: String,
    /// Maximum documents this node will hold
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Maximum documents per VP-tree leaf
    pub leaf_size: usize,
    /// Candidates sampled during vantage-point selection
    pub sample_size: usize,
    /// Weight of the name-vector cosine distance
    pub name_weight: f64,
    /// Weight of the MinHash Jaccard distance
    pub content_weight: f64,
    /// Weight of the topic-distribution divergence
    pub topic_weight: f64,
    /// Multiplier widening k-NN pruning; 1.0 is the reference behavior
    pub pruning_slack: f64,
    /// Radius used to gather nearby partitions for query fan-out
    pub query_neighborhood_radius: f64,
    /// Extra leaves consulted beyond the owning partition
    pub max_query_partitions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub target_replication_factor: usize,
    pub max_concurrent_replications: usize,
    pub replication_timeout_sec: f64,
    pub retry_count: u32,
    pub retry_delay_sec: f64,
    pub check_interval_sec: f64,
    /// Minimum similarity for a graph edge
    pub similarity_threshold: f64,
    /// Neighbor cap per document in the similarity graph
    pub max_neighbors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    pub imbalance_threshold: f64,
    pub critical_threshold: f64,
    pub min_transfer_size: usize,
    pub check_interval_sec: f64,
    pub cooldown_after_rebalance_sec: f64,
    pub batch_size: usize,
    pub batch_delay_sec: f64,
    pub max_retries: u32,
    pub retry_delay_sec: f64,
    pub transfer_timeout_sec: f64,
    pub max_documents_per_rebalance: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub heartbeat_interval_sec: f64,
    pub failure_timeout_sec: f64,
    pub suspect_threshold: u32,
    pub failure_threshold: u32,
    pub max_concurrent_rereplications: usize,
    pub re_replication_batch_size: usize,
    pub re_replication_retry_limit: u32,
    pub assessment_delay_sec: f64,
    pub verification_timeout_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub target_nodes: usize,
    /// Seed addresses probed at startup for an existing cluster
    pub seed_nodes: Vec<String>,
    pub allow_single_node: bool,
    pub max_discovery_attempts: u32,
    pub peer_discovery_interval_sec: f64,
    pub election_timeout_sec: f64,
    pub coordinator_timeout_sec: f64,
}

impl VantageConfig {
    /// Load configuration from `config.json`, creating the file with
    /// defaults when absent.
    pub async fn load() -> Result<Self> {
        Self::load_from("config.json").await
    }

    pub async fn load_from(path: &str) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("failed to parse config {}: {}", path, e)),
            Err(_) => {
                let default_config = Self::default();
                default_config.save_to(path).await?;
                Ok(default_config)
            }
        }
    }

    pub async fn save_to(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Validate cross-field constraints before startup.
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
        if self.index.leaf_size == 0 {
            anyhow::bail!("leaf_size must be at least 1");
        }
        let weight_sum =
            self.index.name_weight + self.index.content_weight + self.index.topic_weight;
        if weight_sum <= 0.0 {
            anyhow::bail!("distance weights must sum to a positive value");
        }
        if self.cluster.target_nodes == 0 {
            anyhow::bail!("target_nodes must be at least 1");
        }
        if self.recovery.failure_threshold < self.recovery.suspect_threshold {
            anyhow::bail!("failure_threshold must be >= suspect_threshold");
        }
        Ok(())
    }
}

impl Default for VantageConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            index: IndexConfig::default(),
            replication: ReplicationConfig::default(),
            rebalance: RebalanceConfig::default(),
            recovery: RecoveryConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::new_v4()),
            address: "127.0.0.1:7400".to_string(),
            data_dir: "./data".to_string(),
            capacity: 10_000,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            leaf_size: 50,
            sample_size: 10,
            name_weight: 0.4,
            content_weight: 0.4,
            topic_weight: 0.2,
            pruning_slack: 1.0,
            query_neighborhood_radius: 0.3,
            max_query_partitions: 5,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            target_replication_factor: 2,
            max_concurrent_replications: 5,
            replication_timeout_sec: 60.0,
            retry_count: 3,
            retry_delay_sec: 5.0,
            check_interval_sec: 30.0,
            similarity_threshold: 0.3,
            max_neighbors: 20,
        }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            imbalance_threshold: 0.2,
            critical_threshold: 0.9,
            min_transfer_size: 10,
            check_interval_sec: 60.0,
            cooldown_after_rebalance_sec: 300.0,
            batch_size: 50,
            batch_delay_sec: 1.0,
            max_retries: 3,
            retry_delay_sec: 5.0,
            transfer_timeout_sec: 30.0,
            max_documents_per_rebalance: 1000,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_sec: 5.0,
            failure_timeout_sec: 15.0,
            suspect_threshold: 2,
            failure_threshold: 3,
            max_concurrent_rereplications: 5,
            re_replication_batch_size: 20,
            re_replication_retry_limit: 3,
            assessment_delay_sec: 2.0,
            verification_timeout_sec: 60.0,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            target_nodes: 3,
            seed_nodes: Vec::new(),
            allow_single_node: true,
            max_discovery_attempts: 3,
            peer_discovery_interval_sec: 10.0,
            election_timeout_sec: 5.0,
            coordinator_timeout_sec: 10.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = VantageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.index.leaf_size, 50);
        assert_eq!(config.replication.target_replication_factor, 2);
        assert_eq!(config.rebalance.batch_size, 50);
        assert_eq!(config.cluster.target_nodes, 3);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let mut config = VantageConfig::default();
        config.index.name_weight = 0.0;
        config.index.content_weight = 0.0;
        config.index.topic_weight = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut config = VantageConfig::default();
        config.recovery.suspect_threshold = 5;
        config.recovery.failure_threshold = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_serialization() {
        let config = VantageConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: VantageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.index.leaf_size, config.index.leaf_size);
        assert_eq!(parsed.node.capacity, config.node.capacity);
    }
}
