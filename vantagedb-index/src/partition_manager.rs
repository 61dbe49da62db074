//! High-level partition management.
//!
//! Couples the VP-tree with node assignment: building partitions from a
//! corpus, routing new documents to a primary plus replicas, answering
//! nearest-neighbor queries, and telling the query layer which nodes are
//! worth contacting for a given query.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vantagedb_core::error::CoreResult;
use vantagedb_core::types::{Document, DocumentId, NodeId, PartitionId};

use crate::assignment::{AssignmentStrategy, NodeAssigner};
use crate::distance::{DistanceCalculator, DistanceWeights};
use crate::vp_tree::{LeafAssignment, PartitionInfo, TreeStatistics, VantageStrategy, VpTree};

/// Routing decision for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    pub document_id: DocumentId,
    pub partition_id: Option<PartitionId>,
    pub primary_node: NodeId,
    pub replica_nodes: Vec<NodeId>,
}

/// Outcome of a partition build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStats {
    pub tree: TreeStatistics,
    pub partition_assignments: usize,
    pub last_rebuild: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PartitionManagerConfig {
    pub leaf_size: usize,
    pub sample_size: usize,
    pub replication_factor: usize,
    pub weights: DistanceWeights,
    pub vantage_strategy: VantageStrategy,
    pub pruning_slack: f64,
    /// Radius used to collect nearby partitions for query fan-out
    pub query_neighborhood_radius: f64,
    /// Leaves consulted beyond the owning partition
    pub max_query_partitions: usize,
}

impl Default for PartitionManagerConfig {
    fn default() -> Self {
        Self {
            leaf_size: 50,
            sample_size: 10,
            replication_factor: 2,
            weights: DistanceWeights::default(),
            vantage_strategy: VantageStrategy::KMedoids,
            pruning_slack: 1.0,
            query_neighborhood_radius: 0.3,
            max_query_partitions: 5,
        }
    }
}

pub struct PartitionManager {
    config: PartitionManagerConfig,
    distance: DistanceCalculator,

    // The tree is immutable between builds; a rebuild swaps it under the
    // write lock while searches share the read lock.
    tree: RwLock<VpTree>,
    assigner: RwLock<NodeAssigner>,
    partition_assignments: RwLock<HashMap<PartitionId, NodeId>>,

    initialized: RwLock<bool>,
    last_rebuild: RwLock<Option<DateTime<Utc>>>,
    document_count: RwLock<usize>,
}

impl PartitionManager {
    pub fn new(config: PartitionManagerConfig) -> Self {
        let distance = DistanceCalculator::new(config.weights);
        let tree = VpTree::new(
            distance.clone(),
            config.leaf_size,
            config.vantage_strategy,
            config.sample_size,
        )
        .with_pruning_slack(config.pruning_slack);
        let assigner = NodeAssigner::new(
            distance.clone(),
            config.replication_factor,
            AssignmentStrategy::SemanticAffinity,
        );

        Self {
            config,
            distance,
            tree: RwLock::new(tree),
            assigner: RwLock::new(assigner),
            partition_assignments: RwLock::new(HashMap::new()),
            initialized: RwLock::new(false),
            last_rebuild: RwLock::new(None),
            document_count: RwLock::new(0),
        }
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.read()
    }

    pub fn set_replication_factor(&self, factor: usize) {
        self.assigner.write().set_replication_factor(factor);
    }

    pub fn register_node(&self, node_id: NodeId, address: String, capacity: usize) {
        self.assigner
            .write()
            .register_node(node_id, address, capacity, Vec::new());
    }

    /// Remove a node, reassigning its partitions to the least-loaded
    /// survivor. Returns document ids needing reassignment.
    pub fn unregister_node(&self, node_id: &NodeId) -> Vec<DocumentId> {
        {
            let mut assignments = self.partition_assignments.write();
            let assigner = self.assigner.read();
            let replacement = assigner
                .healthy_nodes()
                .into_iter()
                .filter(|n| &n.node_id != node_id)
                .min_by(|a, b| {
                    a.load_factor()
                        .partial_cmp(&b.load_factor())
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.node_id.cmp(&b.node_id))
                })
                .map(|n| n.node_id.clone());

            for assigned in assignments.values_mut() {
                if assigned == node_id {
                    match &replacement {
                        Some(new_node) => *assigned = new_node.clone(),
                        None => warn!("no replacement node for partitions of {}", node_id),
                    }
                }
            }
            assignments.retain(|_, assigned| assigned != node_id);
        }

        self.assigner.write().unregister_node(node_id)
    }

    pub fn update_node_stats(
        &self,
        node_id: &NodeId,
        document_count: Option<usize>,
        health: Option<vantagedb_core::types::NodeHealthStatus>,
    ) {
        self.assigner
            .write()
            .update_node_stats(node_id, document_count, health, Some(Utc::now()));
    }

    /// Build partitions from a corpus and assign leaves to cluster nodes.
    pub fn build(&self, documents: Vec<Document>, cluster_nodes: Option<Vec<NodeId>>) -> BuildStats {
        info!("building partitions for {} documents", documents.len());
        let count = documents.len();

        let nodes = cluster_nodes.unwrap_or_else(|| {
            let assigner = self.assigner.read();
            let mut ids: Vec<NodeId> = assigner
                .healthy_nodes()
                .into_iter()
                .map(|n| n.node_id.clone())
                .collect();
            ids.sort();
            ids
        });

        let assignments = {
            let mut tree = self.tree.write();
            tree.build(documents);
            if nodes.is_empty() {
                HashMap::new()
            } else {
                tree.assign_nodes_to_partitions(&nodes, LeafAssignment::Balanced)
            }
        };

        let now = Utc::now();
        *self.partition_assignments.write() = assignments;
        *self.initialized.write() = true;
        *self.last_rebuild.write() = Some(now);
        *self.document_count.write() = count;

        let stats = BuildStats {
            tree: self.tree.read().statistics(),
            partition_assignments: self.partition_assignments.read().len(),
            last_rebuild: now,
        };
        info!(
            "partitions built: {} leaves over {} nodes",
            stats.tree.leaf_nodes, stats.partition_assignments
        );
        stats
    }

    /// Route a document: locate its VP-tree leaf, resolve the owning
    /// cluster node from the assignment table, and pick replicas by
    /// semantic affinity.
    pub fn route(&self, document: &Document) -> CoreResult<RoutingResult> {
        let (partition_id, partition_node) = if self.is_initialized() {
            let tree = self.tree.read();
            match tree.find_partition(document) {
                Some(partition_id) => {
                    let node = self
                        .partition_assignments
                        .read()
                        .get(&partition_id)
                        .cloned();
                    (Some(partition_id), node)
                }
                None => (None, None),
            }
        } else {
            (None, None)
        };

        let strategy = if partition_node.is_some() {
            AssignmentStrategy::VpTreePartition
        } else {
            AssignmentStrategy::SemanticAffinity
        };

        let result = self.assigner.write().assign_document(
            document,
            Some(strategy),
            partition_id.clone(),
            partition_node,
        )?;

        Ok(RoutingResult {
            document_id: result.document_id,
            partition_id,
            primary_node: result.assigned_node,
            replica_nodes: result.replica_nodes,
        })
    }

    /// k nearest documents, empty when partitions are not built yet.
    pub fn nearest(
        &self,
        query: &Document,
        k: usize,
        max_distance: Option<f64>,
    ) -> Vec<(Document, f64)> {
        if !self.is_initialized() {
            warn!("partitions not initialized, returning empty result");
            return Vec::new();
        }
        self.tree.read().search_knn(query, k, max_distance)
    }

    pub fn in_range(&self, query: &Document, radius: f64) -> Vec<(Document, f64)> {
        if !self.is_initialized() {
            return Vec::new();
        }
        self.tree.read().search_range(query, radius)
    }

    /// Nodes a distributed search should contact for this query: the leaf
    /// owner plus owners of leaves holding documents within the query
    /// neighborhood. Falls back to all healthy nodes when no partition
    /// information exists.
    pub fn nodes_for_query(&self, query: &Document) -> Vec<NodeId> {
        let mut nodes: HashSet<NodeId> = HashSet::new();

        if self.is_initialized() {
            let tree = self.tree.read();
            let assignments = self.partition_assignments.read();

            if let Some(partition_id) = tree.find_partition(query) {
                if let Some(node) = assignments.get(&partition_id) {
                    nodes.insert(node.clone());
                }
            }

            let mut extra_partitions: HashSet<PartitionId> = HashSet::new();
            for (doc, _) in tree.search_range(query, self.config.query_neighborhood_radius) {
                if extra_partitions.len() >= self.config.max_query_partitions {
                    break;
                }
                if let Some(partition_id) = tree.partition_of(&doc.id) {
                    if extra_partitions.insert(partition_id.clone()) {
                        if let Some(node) = assignments.get(&partition_id) {
                            nodes.insert(node.clone());
                        }
                    }
                }
            }
        }

        if nodes.is_empty() {
            let assigner = self.assigner.read();
            nodes = assigner
                .healthy_nodes()
                .into_iter()
                .map(|n| n.node_id.clone())
                .collect();
        }

        let mut out: Vec<NodeId> = nodes.into_iter().collect();
        out.sort();
        out
    }

    pub fn partition_info(&self, partition_id: &PartitionId) -> Option<PartitionInfo> {
        let tree = self.tree.read();
        let mut info = tree
            .all_partitions()
            .into_iter()
            .find(|p| &p.partition_id == partition_id)?;
        info.assigned_node = self
            .partition_assignments
            .read()
            .get(partition_id)
            .cloned();
        Some(info)
    }

    pub fn all_partitions(&self) -> Vec<PartitionInfo> {
        let assignments = self.partition_assignments.read();
        self.tree
            .read()
            .leaf_partitions()
            .into_iter()
            .map(|mut info| {
                info.assigned_node = assignments.get(&info.partition_id).cloned();
                info
            })
            .collect()
    }

    pub fn node_partitions(&self, node_id: &NodeId) -> Vec<PartitionId> {
        self.partition_assignments
            .read()
            .iter()
            .filter(|(_, assigned)| *assigned == node_id)
            .map(|(partition_id, _)| partition_id.clone())
            .collect()
    }

    /// Load spread exceeds the threshold and a rebalance should run.
    pub fn needs_rebalance(&self, threshold: f64) -> bool {
        !self.assigner.read().is_balanced(threshold)
    }

    pub fn distance_calculator(&self) -> &DistanceCalculator {
        &self.distance
    }

    pub fn statistics(&self) -> PartitionManagerStats {
        let assigner = self.assigner.read();
        PartitionManagerStats {
            initialized: self.is_initialized(),
            document_count: *self.document_count.read(),
            last_rebuild: *self.last_rebuild.read(),
            partition_count: self.partition_assignments.read().len(),
            registered_nodes: assigner.all_nodes().len(),
            healthy_nodes: assigner.healthy_nodes().len(),
            load_distribution: assigner.load_distribution(),
            tree: if self.is_initialized() {
                Some(self.tree.read().statistics())
            } else {
                None
            },
        }
    }

    /// Export the assignment table for persistence.
    pub fn export_assignments(&self) -> HashMap<PartitionId, NodeId> {
        self.partition_assignments.read().clone()
    }

    /// Restore the assignment table from a snapshot. The manager counts as
    /// initialized once assignments exist, so routing resolves against the
    /// restored table even before the next rebuild.
    pub fn import_assignments(&self, assignments: HashMap<PartitionId, NodeId>) {
        let has_assignments = !assignments.is_empty();
        *self.partition_assignments.write() = assignments;
        if has_assignments {
            *self.initialized.write() = true;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionManagerStats {
    pub initialized: bool,
    pub document_count: usize,
    pub last_rebuild: Option<DateTime<Utc>>,
    pub partition_count: usize,
    pub registered_nodes: usize,
    pub healthy_nodes: usize,
    pub load_distribution: HashMap<NodeId, f64>,
    pub tree: Option<TreeStatistics>,
}
