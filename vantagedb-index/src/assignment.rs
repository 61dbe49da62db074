//! Document-to-node assignment strategies.
//!
//! Primary placement supports round-robin, least-loaded, consistent-hash,
//! semantic-affinity and VP-tree-partition strategies. Replicas always use
//! semantic affinity: a document lands next to the nodes already holding
//! its most similar neighbors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vantagedb_core::error::{CoreError, CoreResult};
use vantagedb_core::types::{ClusterNode, Document, DocumentId, NodeHealthStatus, NodeId, PartitionId};

use crate::distance::DistanceCalculator;

/// Virtual nodes per physical node on the consistent-hash ring.
const VIRTUAL_NODES: usize = 150;

/// Documents sampled per node when scoring semantic affinity.
const AFFINITY_SAMPLE: usize = 10;

/// Load penalty weight mixed into affinity scores.
const LOAD_PENALTY: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentStrategy {
    RoundRobin,
    LeastLoaded,
    SemanticAffinity,
    ConsistentHash,
    VpTreePartition,
}

/// Result of placing one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentResult {
    pub document_id: DocumentId,
    pub assigned_node: NodeId,
    pub partition_id: Option<PartitionId>,
    pub replica_nodes: Vec<NodeId>,
    pub assignment_reason: String,
}

/// Assigns documents to cluster nodes and tracks the resulting placement.
pub struct NodeAssigner {
    distance: DistanceCalculator,
    replication_factor: usize,
    default_strategy: AssignmentStrategy,

    nodes: HashMap<NodeId, ClusterNode>,
    node_documents: HashMap<NodeId, Vec<Document>>,
    assignments: HashMap<DocumentId, AssignmentResult>,
    hash_ring: Vec<(u64, NodeId)>,
}

impl NodeAssigner {
    pub fn new(
        distance: DistanceCalculator,
        replication_factor: usize,
        default_strategy: AssignmentStrategy,
    ) -> Self {
        Self {
            distance,
            replication_factor,
            default_strategy,
            nodes: HashMap::new(),
            node_documents: HashMap::new(),
            assignments: HashMap::new(),
            hash_ring: Vec::new(),
        }
    }

    pub fn set_replication_factor(&mut self, factor: usize) {
        self.replication_factor = factor;
    }

    pub fn register_node(
        &mut self,
        node_id: NodeId,
        address: String,
        capacity: usize,
        initial_docs: Vec<Document>,
    ) {
        let mut node = ClusterNode::new(node_id.clone(), address, capacity);
        node.document_count = initial_docs.len();
        node.health = NodeHealthStatus::Healthy;

        self.nodes.insert(node_id.clone(), node);
        if !initial_docs.is_empty() {
            self.node_documents.insert(node_id.clone(), initial_docs);
        }
        self.rebuild_hash_ring();
        info!("registered node {}", node_id);
    }

    /// Remove a node, promoting recorded replicas where it was primary.
    /// Returns documents left without any copy.
    pub fn unregister_node(&mut self, node_id: &NodeId) -> Vec<DocumentId> {
        let mut orphaned = Vec::new();

        self.nodes.remove(node_id);
        if let Some(docs) = self.node_documents.remove(node_id) {
            for doc in docs {
                orphaned.push(doc.id);
            }
        }

        for result in self.assignments.values_mut() {
            if &result.assigned_node == node_id {
                if result.replica_nodes.is_empty() {
                    orphaned.push(result.document_id.clone());
                } else {
                    result.assigned_node = result.replica_nodes.remove(0);
                }
            } else {
                result.replica_nodes.retain(|n| n != node_id);
            }
        }

        self.rebuild_hash_ring();
        info!(
            "unregistered node {}, {} documents need reassignment",
            node_id,
            orphaned.len()
        );
        orphaned
    }

    pub fn update_node_stats(
        &mut self,
        node_id: &NodeId,
        document_count: Option<usize>,
        health: Option<NodeHealthStatus>,
        last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        let Some(node) = self.nodes.get_mut(node_id) else {
            warn!("unknown node in stats update: {}", node_id);
            return;
        };
        if let Some(count) = document_count {
            node.document_count = count;
        }
        if let Some(health) = health {
            node.health = health;
        }
        if let Some(ts) = last_heartbeat {
            node.last_heartbeat = Some(ts);
        }
    }

    fn rebuild_hash_ring(&mut self) {
        self.hash_ring.clear();
        for node_id in self.nodes.keys() {
            for i in 0..VIRTUAL_NODES {
                let key = format!("{}:{}", node_id, i);
                self.hash_ring.push((hash64(&key), node_id.clone()));
            }
        }
        self.hash_ring.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    }

    fn hash_assignment(&self, document_id: &DocumentId) -> Option<NodeId> {
        if self.hash_ring.is_empty() {
            return None;
        }
        let doc_hash = hash64(&document_id.0);
        let pos = self
            .hash_ring
            .partition_point(|(h, _)| *h < doc_hash)
            % self.hash_ring.len();
        Some(self.hash_ring[pos].1.clone())
    }

    fn healthy_with_capacity(&self) -> Vec<&ClusterNode> {
        let mut nodes: Vec<&ClusterNode> = self
            .nodes
            .values()
            .filter(|n| n.is_healthy() && n.available_capacity() > 0)
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    fn round_robin_assignment(&self, document_id: &DocumentId) -> Option<NodeId> {
        let healthy = self.healthy_with_capacity();
        if healthy.is_empty() {
            return None;
        }
        let idx = (hash64(&document_id.0) as usize) % healthy.len();
        Some(healthy[idx].node_id.clone())
    }

    fn least_loaded_assignment(&self) -> Option<NodeId> {
        self.healthy_with_capacity()
            .into_iter()
            .min_by(|a, b| {
                cmp_f64(a.load_factor(), b.load_factor()).then_with(|| a.node_id.cmp(&b.node_id))
            })
            .map(|n| n.node_id.clone())
    }

    /// Place the document on the node already holding the most similar
    /// content: score each candidate by the average distance to a sample of
    /// its documents plus a load penalty; lowest adjusted score wins.
    fn semantic_affinity_assignment(
        &self,
        document: &Document,
        exclude: &[NodeId],
    ) -> Option<NodeId> {
        let candidates: Vec<&ClusterNode> = self
            .healthy_with_capacity()
            .into_iter()
            .filter(|n| !exclude.contains(&n.node_id))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut best: Option<(f64, NodeId)> = None;
        for node in candidates {
            let affinity = match self.node_documents.get(&node.node_id) {
                Some(docs) if !docs.is_empty() => {
                    let sample = &docs[..docs.len().min(AFFINITY_SAMPLE)];
                    let total: f64 = sample
                        .iter()
                        .map(|doc| self.distance.document_distance(document, doc))
                        .sum();
                    total / sample.len() as f64
                }
                // Empty node scores neutral
                _ => 0.5,
            };

            let adjusted = affinity + node.load_factor() * LOAD_PENALTY;
            let better = match &best {
                None => true,
                Some((score, id)) => {
                    adjusted < *score - 1e-12
                        || ((adjusted - score).abs() <= 1e-12 && node.node_id < *id)
                }
            };
            if better {
                best = Some((adjusted, node.node_id.clone()));
            }
        }

        best.map(|(_, id)| id)
    }

    /// Assign a document to a primary plus replicas.
    ///
    /// `partition_node` carries the cluster node resolved from the VP-tree
    /// assignment table when routing by partition; the assigner falls back
    /// to semantic affinity when no resolution exists.
    pub fn assign_document(
        &mut self,
        document: &Document,
        strategy: Option<AssignmentStrategy>,
        partition_id: Option<PartitionId>,
        partition_node: Option<NodeId>,
    ) -> CoreResult<AssignmentResult> {
        let strategy = strategy.unwrap_or(self.default_strategy);

        let primary = match strategy {
            AssignmentStrategy::RoundRobin => self.round_robin_assignment(&document.id),
            AssignmentStrategy::LeastLoaded => self.least_loaded_assignment(),
            AssignmentStrategy::ConsistentHash => self.hash_assignment(&document.id),
            AssignmentStrategy::SemanticAffinity => {
                self.semantic_affinity_assignment(document, &[])
            }
            AssignmentStrategy::VpTreePartition => partition_node
                .clone()
                .or_else(|| self.semantic_affinity_assignment(document, &[])),
        };

        let primary = primary.ok_or(CoreError::NoHealthyNodes)?;
        let replicas = self.select_replica_nodes(document, &primary);

        let result = AssignmentResult {
            document_id: document.id.clone(),
            assigned_node: primary.clone(),
            partition_id,
            replica_nodes: replicas,
            assignment_reason: format!("strategy: {:?}", strategy),
        };

        self.assignments
            .insert(document.id.clone(), result.clone());
        self.node_documents
            .entry(primary.clone())
            .or_default()
            .push(document.clone());
        if let Some(node) = self.nodes.get_mut(&primary) {
            node.document_count += 1;
        }

        Ok(result)
    }

    fn select_replica_nodes(&self, document: &Document, primary: &NodeId) -> Vec<NodeId> {
        let mut replicas = Vec::new();
        let mut exclude = vec![primary.clone()];

        for _ in 1..self.replication_factor.max(1) {
            match self.semantic_affinity_assignment(document, &exclude) {
                Some(node) => {
                    exclude.push(node.clone());
                    replicas.push(node);
                }
                None => break,
            }
        }

        replicas
    }

    pub fn document_location(&self, document_id: &DocumentId) -> Option<&AssignmentResult> {
        self.assignments.get(document_id)
    }

    pub fn node_stats(&self, node_id: &NodeId) -> Option<&ClusterNode> {
        self.nodes.get(node_id)
    }

    pub fn all_nodes(&self) -> Vec<&ClusterNode> {
        self.nodes.values().collect()
    }

    pub fn healthy_nodes(&self) -> Vec<&ClusterNode> {
        self.nodes.values().filter(|n| n.is_healthy()).collect()
    }

    pub fn load_distribution(&self) -> HashMap<NodeId, f64> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.load_factor()))
            .collect()
    }

    /// Max-min load spread stays within the threshold.
    pub fn is_balanced(&self, threshold: f64) -> bool {
        let loads: Vec<f64> = self.load_distribution().values().copied().collect();
        if loads.is_empty() {
            return true;
        }
        let max = loads.iter().cloned().fold(f64::MIN, f64::max);
        let min = loads.iter().cloned().fold(f64::MAX, f64::min);
        (max - min) <= threshold
    }
}

fn hash64(key: &str) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    let bytes = hash.as_bytes();
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

fn cmp_f64(a: f64, b: f64) -> std::cmp::Ordering {
    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantagedb_core::types::VectorBundle;

    fn doc(id: &str, topics: Vec<f64>) -> Document {
        Document::new(
            id,
            100,
            VectorBundle {
                name_vector: Some([("t".to_string(), 1.0)].into_iter().collect()),
                minhash_signature: Some(vec![1, 2, 3, 4]),
                topic_distribution: Some(topics),
            },
        )
    }

    fn assigner() -> NodeAssigner {
        let mut a = NodeAssigner::new(
            DistanceCalculator::default(),
            2,
            AssignmentStrategy::SemanticAffinity,
        );
        a.register_node(NodeId::from("n1"), "h1:1".into(), 100, vec![]);
        a.register_node(NodeId::from("n2"), "h2:1".into(), 100, vec![]);
        a.register_node(NodeId::from("n3"), "h3:1".into(), 100, vec![]);
        a
    }

    #[test]
    fn test_no_nodes_is_typed_error() {
        let mut a = NodeAssigner::new(
            DistanceCalculator::default(),
            2,
            AssignmentStrategy::LeastLoaded,
        );
        let err = a
            .assign_document(&doc("d1", vec![1.0]), None, None, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::NoHealthyNodes));
    }

    #[test]
    fn test_assignment_tracks_counts() {
        let mut a = assigner();
        let result = a
            .assign_document(&doc("d1", vec![0.5, 0.5]), None, None, None)
            .unwrap();

        let stats = a.node_stats(&result.assigned_node).unwrap();
        assert_eq!(stats.document_count, 1);
        assert_eq!(result.replica_nodes.len(), 1);
        assert_ne!(result.replica_nodes[0], result.assigned_node);
    }

    #[test]
    fn test_consistent_hash_is_stable() {
        let mut a = assigner();
        let first = a
            .assign_document(
                &doc("d1", vec![1.0]),
                Some(AssignmentStrategy::ConsistentHash),
                None,
                None,
            )
            .unwrap();

        let mut b = assigner();
        let second = b
            .assign_document(
                &doc("d1", vec![1.0]),
                Some(AssignmentStrategy::ConsistentHash),
                None,
                None,
            )
            .unwrap();

        assert_eq!(first.assigned_node, second.assigned_node);
    }

    #[test]
    fn test_least_loaded_prefers_empty_node() {
        let mut a = assigner();
        a.update_node_stats(&NodeId::from("n1"), Some(50), None, None);
        a.update_node_stats(&NodeId::from("n2"), Some(10), None, None);
        a.update_node_stats(&NodeId::from("n3"), Some(90), None, None);

        let result = a
            .assign_document(
                &doc("d1", vec![1.0]),
                Some(AssignmentStrategy::LeastLoaded),
                None,
                None,
            )
            .unwrap();
        assert_eq!(result.assigned_node, NodeId::from("n2"));
    }

    #[test]
    fn test_vp_tree_strategy_uses_resolved_node() {
        let mut a = assigner();
        let result = a
            .assign_document(
                &doc("d1", vec![1.0]),
                Some(AssignmentStrategy::VpTreePartition),
                Some(PartitionId::from("vpn_3")),
                Some(NodeId::from("n2")),
            )
            .unwrap();
        assert_eq!(result.assigned_node, NodeId::from("n2"));
        assert_eq!(result.partition_id, Some(PartitionId::from("vpn_3")));
    }

    #[test]
    fn test_affinity_pulls_similar_documents_together() {
        let mut a = assigner();

        // Seed n1 with sports-like topics, n3 with science-like topics
        a.register_node(
            NodeId::from("n1"),
            "h1:1".into(),
            100,
            vec![doc("sports1", vec![0.9, 0.05, 0.05])],
        );
        a.register_node(
            NodeId::from("n3"),
            "h3:1".into(),
            100,
            vec![doc("science1", vec![0.05, 0.05, 0.9])],
        );

        let result = a
            .assign_document(&doc("sports2", vec![0.88, 0.07, 0.05]), None, None, None)
            .unwrap();
        assert_eq!(result.assigned_node, NodeId::from("n1"));
    }

    #[test]
    fn test_unregister_promotes_replica() {
        let mut a = assigner();
        let result = a
            .assign_document(&doc("d1", vec![0.5, 0.5]), None, None, None)
            .unwrap();
        let primary = result.assigned_node.clone();
        let replica = result.replica_nodes[0].clone();

        let orphaned = a.unregister_node(&primary);
        let location = a.document_location(&DocumentId::from("d1")).unwrap();
        assert_eq!(location.assigned_node, replica);
        // Replica existed, so nothing is fully orphaned besides the primary copy
        assert!(orphaned.contains(&DocumentId::from("d1")));
    }

    #[test]
    fn test_is_balanced_threshold() {
        let mut a = assigner();
        a.update_node_stats(&NodeId::from("n1"), Some(10), None, None);
        a.update_node_stats(&NodeId::from("n2"), Some(12), None, None);
        a.update_node_stats(&NodeId::from("n3"), Some(11), None, None);
        assert!(a.is_balanced(0.2));

        a.update_node_stats(&NodeId::from("n1"), Some(90), None, None);
        assert!(!a.is_balanced(0.2));
    }
}
