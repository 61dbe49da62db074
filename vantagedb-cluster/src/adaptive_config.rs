//! Adaptive cluster configuration.
//!
//! The cluster always operates, down to a single node. Replication factor,
//! quorum size, operation mode and consistency level are all derived from
//! the number of healthy nodes; fault tolerance is whatever the current
//! effective replication factor can actually deliver.
//!
//! This system is availability-first: a minority partition keeps serving
//! reads and writes in PARTITIONED mode with writes tagged un-synced,
//! rather than dropping into read-only.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use vantagedb_core::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Full-cluster agreement
    Strong,
    /// Best effort, asynchronous replication
    Eventual,
    /// Single node, no replication
    Local,
    /// Majority of available nodes
    Quorum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMode {
    Normal,
    Degraded,
    SingleNode,
    Partitioned,
    /// Reserved for operator intervention; no automatic transition enters it
    Readonly,
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationMode::Normal => "normal",
            OperationMode::Degraded => "degraded",
            OperationMode::SingleNode => "single_node",
            OperationMode::Partitioned => "partitioned",
            OperationMode::Readonly => "readonly",
        };
        write!(f, "{}", s)
    }
}

/// Effective cluster parameters derived from node availability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveClusterConfig {
    pub target_nodes: usize,
    pub target_replication_factor: usize,
    pub target_quorum_size: usize,

    pub current_nodes: usize,
    pub effective_replication_factor: usize,
    pub effective_quorum_size: usize,

    pub operation_mode: OperationMode,
    pub consistency_level: ConsistencyLevel,

    pub min_nodes_for_quorum: usize,

    pub is_partitioned: bool,
    pub is_majority: bool,
    pub partition_id: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl AdaptiveClusterConfig {
    pub fn new(target_nodes: usize, target_replication_factor: usize) -> Self {
        let mut config = Self {
            target_nodes,
            target_replication_factor,
            target_quorum_size: target_nodes / 2 + 1,
            current_nodes: 1,
            effective_replication_factor: 0,
            effective_quorum_size: 1,
            operation_mode: OperationMode::SingleNode,
            consistency_level: ConsistencyLevel::Local,
            min_nodes_for_quorum: 3,
            is_partitioned: false,
            is_majority: true,
            partition_id: None,
            last_update: Utc::now(),
        };
        config.update_for_cluster_size(1);
        config
    }

    /// Recompute effective parameters for the given healthy node count.
    /// Returns the set of fields that changed.
    pub fn update_for_cluster_size(&mut self, available_nodes: usize) -> HashMap<String, String> {
        let old = (
            self.current_nodes,
            self.effective_replication_factor,
            self.effective_quorum_size,
            self.operation_mode,
            self.consistency_level,
        );

        self.current_nodes = available_nodes;
        self.last_update = Utc::now();

        // Replicas cannot outnumber the other nodes
        self.effective_replication_factor = if available_nodes >= self.target_replication_factor + 1
        {
            self.target_replication_factor
        } else if available_nodes >= 2 {
            1
        } else {
            0
        };

        self.effective_quorum_size = if available_nodes >= self.min_nodes_for_quorum {
            available_nodes / 2 + 1
        } else if available_nodes >= 2 {
            2
        } else {
            1
        };

        if available_nodes <= 1 {
            self.operation_mode = OperationMode::SingleNode;
            self.consistency_level = ConsistencyLevel::Local;
        } else if available_nodes < self.target_nodes {
            self.operation_mode = OperationMode::Degraded;
            self.consistency_level = if available_nodes >= self.min_nodes_for_quorum {
                ConsistencyLevel::Quorum
            } else {
                ConsistencyLevel::Eventual
            };
        } else {
            self.operation_mode = OperationMode::Normal;
            self.consistency_level = ConsistencyLevel::Strong;
            self.effective_quorum_size = self.target_quorum_size;
        }

        let mut changes = HashMap::new();
        let new = (
            self.current_nodes,
            self.effective_replication_factor,
            self.effective_quorum_size,
            self.operation_mode,
            self.consistency_level,
        );
        if old.0 != new.0 {
            changes.insert("nodes".into(), format!("{} -> {}", old.0, new.0));
        }
        if old.1 != new.1 {
            changes.insert("replication_factor".into(), format!("{} -> {}", old.1, new.1));
        }
        if old.2 != new.2 {
            changes.insert("quorum_size".into(), format!("{} -> {}", old.2, new.2));
        }
        if old.3 != new.3 {
            changes.insert("mode".into(), format!("{} -> {}", old.3, new.3));
        }
        if old.4 != new.4 {
            changes.insert("consistency".into(), format!("{:?} -> {:?}", old.4, new.4));
        }

        if !changes.is_empty() {
            info!("cluster config updated: {:?}", changes);
        }
        changes
    }

    /// React to a network partition. The reachable side keeps operating
    /// either way: the majority side runs with recomputed parameters, the
    /// minority side enters PARTITIONED and keeps accepting reads and
    /// writes with eventual consistency; writes are tagged un-synced
    /// instead of being refused.
    pub fn handle_partition(&mut self, nodes_in_partition: &[NodeId], total_known_nodes: usize) {
        let partition_size = nodes_in_partition.len();

        self.is_partitioned = true;
        self.partition_id = Some(format!("partition_{}", Uuid::new_v4().simple()));

        if partition_size > total_known_nodes / 2 {
            info!(
                "majority partition ({}/{}), continuing normally",
                partition_size, total_known_nodes
            );
            self.is_majority = true;
            self.update_for_cluster_size(partition_size);
        } else {
            warn!(
                "minority partition ({}/{}), staying available with un-synced writes",
                partition_size, total_known_nodes
            );
            self.is_majority = false;
            self.update_for_cluster_size(partition_size);
            self.operation_mode = OperationMode::Partitioned;
            self.consistency_level = ConsistencyLevel::Eventual;
        }
    }

    /// Partition healed: every listed node is reachable again.
    pub fn heal_partition(&mut self, all_nodes: &[NodeId]) {
        self.is_partitioned = false;
        self.is_majority = true;
        self.partition_id = None;
        self.update_for_cluster_size(all_nodes.len());
        info!("partition healed, {} nodes reachable", all_nodes.len());
    }

    pub fn can_write(&self) -> bool {
        self.operation_mode != OperationMode::Readonly
    }

    /// Replica losses survivable while keeping at least one copy.
    pub fn fault_tolerance(&self) -> usize {
        self.effective_replication_factor
    }

    pub fn quorum_for_read(&self) -> usize {
        match self.consistency_level {
            ConsistencyLevel::Local | ConsistencyLevel::Eventual => 1,
            ConsistencyLevel::Quorum | ConsistencyLevel::Strong => self.effective_quorum_size,
        }
    }
}

/// Cluster membership bookkeeping on top of the adaptive config.
pub struct AdaptiveClusterManager {
    pub config: AdaptiveClusterConfig,
    known_nodes: HashMap<NodeId, NodeRecord>,
    healthy_nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    address: String,
    status: String,
    joined_at: DateTime<Utc>,
}

impl AdaptiveClusterManager {
    pub fn new(config: AdaptiveClusterConfig) -> Self {
        Self {
            config,
            known_nodes: HashMap::new(),
            healthy_nodes: Vec::new(),
        }
    }

    pub fn healthy_nodes(&self) -> &[NodeId] {
        &self.healthy_nodes
    }

    pub fn known_node_count(&self) -> usize {
        self.known_nodes
            .values()
            .filter(|r| r.status != "left")
            .count()
    }

    pub fn node_joined(&mut self, node_id: NodeId, address: String) -> HashMap<String, String> {
        self.known_nodes.insert(
            node_id.clone(),
            NodeRecord {
                address,
                status: "healthy".to_string(),
                joined_at: Utc::now(),
            },
        );
        if !self.healthy_nodes.contains(&node_id) {
            self.healthy_nodes.push(node_id.clone());
        }

        let changes = self.config.update_for_cluster_size(self.healthy_nodes.len());
        info!(
            "node {} joined, cluster now {} healthy",
            node_id,
            self.healthy_nodes.len()
        );
        changes
    }

    pub fn node_left(&mut self, node_id: &NodeId, reason: &str) -> HashMap<String, String> {
        if let Some(record) = self.known_nodes.get_mut(node_id) {
            record.status = "left".to_string();
        }
        self.healthy_nodes.retain(|id| id != node_id);

        let changes = self.config.update_for_cluster_size(self.healthy_nodes.len());
        info!(
            "node {} left ({}), cluster now {} healthy",
            node_id,
            reason,
            self.healthy_nodes.len()
        );
        changes
    }

    /// A failure shrinking the healthy set below half of the known nodes
    /// is treated as a possible partition.
    pub fn node_failed(&mut self, node_id: &NodeId) {
        if let Some(record) = self.known_nodes.get_mut(node_id) {
            record.status = "failed".to_string();
        }
        self.healthy_nodes.retain(|id| id != node_id);

        let total_known = self.known_node_count();
        if self.healthy_nodes.len() * 2 < total_known {
            let reachable = self.healthy_nodes.clone();
            self.config.handle_partition(&reachable, total_known);
        } else {
            self.config.update_for_cluster_size(self.healthy_nodes.len());
        }
    }

    pub fn node_recovered(&mut self, node_id: &NodeId) {
        if let Some(record) = self.known_nodes.get_mut(node_id) {
            record.status = "healthy".to_string();
        }
        if !self.healthy_nodes.contains(node_id) {
            self.healthy_nodes.push(node_id.clone());
        }

        if self.config.is_partitioned {
            let total_known = self.known_node_count();
            if self.healthy_nodes.len() > total_known / 2 {
                let reachable = self.healthy_nodes.clone();
                self.config.heal_partition(&reachable);
                return;
            }
        }
        self.config.update_for_cluster_size(self.healthy_nodes.len());
    }

    /// Target nodes for replicas of a document led by `primary_node`.
    pub fn replication_targets(&self, primary_node: &NodeId, exclude: &[NodeId]) -> Vec<NodeId> {
        self.healthy_nodes
            .iter()
            .filter(|id| *id != primary_node && !exclude.contains(id))
            .take(self.config.effective_replication_factor)
            .cloned()
            .collect()
    }

    pub fn should_replicate(&self) -> bool {
        self.config.effective_replication_factor > 0
    }
}
