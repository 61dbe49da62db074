//! Document similarity graph.
//!
//! Undirected weighted graph over documents used for affinity-aware replica
//! placement: a replica goes to the node already storing the most similar
//! neighbors. Edges are kept once under canonical endpoint ordering; every
//! vertex additionally carries its own neighbor map for fast iteration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use vantagedb_core::types::{DocumentId, NodeId, VectorBundle};

/// Distance over vector bundles used to derive edge similarities.
pub type BundleDistanceFn = Arc<dyn Fn(&VectorBundle, &VectorBundle) -> f64 + Send + Sync>;

/// Vertex: one document and where it lives.
#[derive(Debug, Clone)]
pub struct GraphDocument {
    pub document_id: DocumentId,
    pub primary_node: NodeId,
    pub replica_nodes: Vec<NodeId>,
    /// neighbor document -> similarity in [0, 1]
    pub neighbors: HashMap<DocumentId, f64>,
    pub created_at: DateTime<Utc>,
}

impl GraphDocument {
    pub fn all_nodes(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.primary_node.clone()];
        nodes.extend(self.replica_nodes.iter().cloned());
        nodes
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub total_documents: usize,
    pub total_edges: usize,
    pub avg_neighbors: f64,
    pub max_neighbors: usize,
    pub nodes_with_documents: usize,
    pub similarity_threshold: f64,
}

pub struct SimilarityGraph {
    similarity_threshold: f64,
    max_neighbors: usize,
    distance_fn: Option<BundleDistanceFn>,

    nodes: HashMap<DocumentId, GraphDocument>,
    /// canonical (smaller id, larger id) -> similarity
    edges: HashMap<(DocumentId, DocumentId), f64>,
    /// cluster node -> documents stored there (primary or replica)
    node_to_docs: HashMap<NodeId, HashSet<DocumentId>>,
    /// cached bundles for computing similarities on insert
    vectors: HashMap<DocumentId, VectorBundle>,
}

impl SimilarityGraph {
    pub fn new(similarity_threshold: f64, max_neighbors: usize) -> Self {
        Self {
            similarity_threshold,
            max_neighbors,
            distance_fn: None,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            node_to_docs: HashMap::new(),
            vectors: HashMap::new(),
        }
    }

    pub fn set_distance_function(&mut self, f: BundleDistanceFn) {
        self.distance_fn = Some(f);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a document. When vectors and a distance function are present,
    /// similarities against the existing corpus are computed and edges above
    /// the threshold are created.
    pub fn add_document(
        &mut self,
        document_id: DocumentId,
        primary_node: NodeId,
        vectors: Option<VectorBundle>,
        replica_nodes: Vec<NodeId>,
    ) {
        let node = GraphDocument {
            document_id: document_id.clone(),
            primary_node: primary_node.clone(),
            replica_nodes: replica_nodes.clone(),
            neighbors: HashMap::new(),
            created_at: Utc::now(),
        };

        self.node_to_docs
            .entry(primary_node)
            .or_default()
            .insert(document_id.clone());
        for replica in replica_nodes {
            self.node_to_docs
                .entry(replica)
                .or_default()
                .insert(document_id.clone());
        }
        self.nodes.insert(document_id.clone(), node);

        if let Some(bundle) = vectors {
            if let Some(distance_fn) = self.distance_fn.clone() {
                let similarities: Vec<(DocumentId, f64)> = self
                    .vectors
                    .iter()
                    .filter(|(other_id, _)| **other_id != document_id)
                    .map(|(other_id, other)| {
                        (other_id.clone(), 1.0 - distance_fn(&bundle, other))
                    })
                    .collect();
                for (other_id, similarity) in similarities {
                    self.add_similarity(&document_id, &other_id, similarity);
                }
            }
            self.vectors.insert(document_id, bundle);
        }
    }

    /// Add or update an edge. Returns false below the threshold or when
    /// either endpoint is unknown.
    pub fn add_similarity(&mut self, a: &DocumentId, b: &DocumentId, similarity: f64) -> bool {
        if similarity < self.similarity_threshold || a == b {
            return false;
        }
        if !self.nodes.contains_key(a) || !self.nodes.contains_key(b) {
            return false;
        }

        self.edges.insert(edge_key(a, b), similarity);
        if let Some(node) = self.nodes.get_mut(a) {
            node.neighbors.insert(b.clone(), similarity);
        }
        if let Some(node) = self.nodes.get_mut(b) {
            node.neighbors.insert(a.clone(), similarity);
        }

        self.prune_neighbors(a);
        self.prune_neighbors(b);
        true
    }

    /// Drop the weakest edges beyond the per-vertex neighbor cap.
    fn prune_neighbors(&mut self, document_id: &DocumentId) {
        let over_capacity = match self.nodes.get(document_id) {
            Some(node) => node.neighbors.len() > self.max_neighbors,
            None => false,
        };
        if !over_capacity {
            return;
        }

        let mut sorted: Vec<(DocumentId, f64)> = self.nodes[document_id]
            .neighbors
            .iter()
            .map(|(id, sim)| (id.clone(), *sim))
            .collect();
        sorted.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let removed: Vec<DocumentId> = sorted
            .drain(self.max_neighbors..)
            .map(|(id, _)| id)
            .collect();

        if let Some(node) = self.nodes.get_mut(document_id) {
            for id in &removed {
                node.neighbors.remove(id);
            }
        }
        for id in removed {
            if let Some(other) = self.nodes.get_mut(&id) {
                other.neighbors.remove(document_id);
            }
            self.edges.remove(&edge_key(document_id, &id));
        }
    }

    pub fn remove_document(&mut self, document_id: &DocumentId) {
        let Some(node) = self.nodes.remove(document_id) else {
            return;
        };

        for storage_node in node.all_nodes() {
            if let Some(docs) = self.node_to_docs.get_mut(&storage_node) {
                docs.remove(document_id);
            }
        }

        for neighbor_id in node.neighbors.keys() {
            if let Some(neighbor) = self.nodes.get_mut(neighbor_id) {
                neighbor.neighbors.remove(document_id);
            }
            self.edges.remove(&edge_key(document_id, neighbor_id));
        }

        self.vectors.remove(document_id);
        debug!("removed {} from similarity graph", document_id);
    }

    pub fn get_document(&self, document_id: &DocumentId) -> Option<&GraphDocument> {
        self.nodes.get(document_id)
    }

    pub fn similarity(&self, a: &DocumentId, b: &DocumentId) -> f64 {
        self.edges.get(&edge_key(a, b)).copied().unwrap_or(0.0)
    }

    /// Strongest neighbors first.
    pub fn neighbors(&self, document_id: &DocumentId, limit: usize) -> Vec<(DocumentId, f64)> {
        let Some(node) = self.nodes.get(document_id) else {
            return Vec::new();
        };
        let mut sorted: Vec<(DocumentId, f64)> = node
            .neighbors
            .iter()
            .map(|(id, sim)| (id.clone(), *sim))
            .collect();
        sorted.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        sorted.truncate(limit);
        sorted
    }

    pub fn documents_on_node(&self, node: &NodeId) -> HashSet<DocumentId> {
        self.node_to_docs.get(node).cloned().unwrap_or_default()
    }

    pub fn update_document_location(
        &mut self,
        document_id: &DocumentId,
        primary_node: Option<NodeId>,
        replica_nodes: Option<Vec<NodeId>>,
    ) {
        let Some(node) = self.nodes.get_mut(document_id) else {
            return;
        };

        if let Some(new_primary) = primary_node {
            if new_primary != node.primary_node {
                if let Some(docs) = self.node_to_docs.get_mut(&node.primary_node) {
                    docs.remove(document_id);
                }
                self.node_to_docs
                    .entry(new_primary.clone())
                    .or_default()
                    .insert(document_id.clone());
                node.primary_node = new_primary;
            }
        }

        if let Some(new_replicas) = replica_nodes {
            let old_replicas = std::mem::take(&mut node.replica_nodes);
            node.replica_nodes = new_replicas.clone();
            // Drop reverse-index entries for replicas that went away
            for old in old_replicas {
                if !new_replicas.contains(&old) {
                    if let Some(docs) = self.node_to_docs.get_mut(&old) {
                        docs.remove(document_id);
                    }
                }
            }
            for new in new_replicas {
                self.node_to_docs
                    .entry(new)
                    .or_default()
                    .insert(document_id.clone());
            }
        }
    }

    /// Score candidate nodes for new replicas of a document.
    ///
    /// A candidate's score is the summed similarity of the document's
    /// neighbors already stored there. Ties break toward the lower load
    /// factor and then the lexicographically smaller node id. Candidates
    /// already holding the document and the primary are skipped.
    pub fn best_replica_nodes(
        &self,
        document_id: &DocumentId,
        candidates: &[(NodeId, f64)],
        num_replicas: usize,
    ) -> Vec<(NodeId, f64)> {
        let Some(node) = self.nodes.get(document_id) else {
            return Vec::new();
        };

        let neighbors = self.neighbors(document_id, 50);
        let holding: HashSet<NodeId> = node.all_nodes().into_iter().collect();

        let mut scored: Vec<(NodeId, f64, f64)> = Vec::new();
        for (candidate, load_factor) in candidates {
            if holding.contains(candidate) {
                continue;
            }
            let node_docs = self.documents_on_node(candidate);
            let affinity: f64 = neighbors
                .iter()
                .filter(|(neighbor_id, _)| node_docs.contains(neighbor_id))
                .map(|(_, similarity)| similarity)
                .sum();
            scored.push((candidate.clone(), affinity, *load_factor));
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.0.cmp(&b.0))
        });

        scored
            .into_iter()
            .take(num_replicas)
            .map(|(id, affinity, _)| (id, affinity))
            .collect()
    }

    /// Pairwise semantic affinity between cluster nodes: for every edge
    /// whose endpoints live on different nodes, the similarity contributes
    /// to the node pair.
    pub fn affinity_matrix(&self, cluster_nodes: &[NodeId]) -> HashMap<NodeId, HashMap<NodeId, f64>> {
        let mut matrix: HashMap<NodeId, HashMap<NodeId, f64>> = cluster_nodes
            .iter()
            .map(|n| {
                (
                    n.clone(),
                    cluster_nodes.iter().map(|m| (m.clone(), 0.0)).collect(),
                )
            })
            .collect();

        for ((doc_a, doc_b), similarity) in &self.edges {
            let (Some(info_a), Some(info_b)) = (self.nodes.get(doc_a), self.nodes.get(doc_b))
            else {
                continue;
            };
            for na in info_a.all_nodes() {
                for nb in info_b.all_nodes() {
                    if let Some(row) = matrix.get_mut(&na) {
                        if let Some(cell) = row.get_mut(&nb) {
                            *cell += similarity;
                        }
                    }
                }
            }
        }

        matrix
    }

    pub fn statistics(&self) -> GraphStatistics {
        let neighbor_counts: Vec<usize> =
            self.nodes.values().map(|n| n.neighbors.len()).collect();
        GraphStatistics {
            total_documents: self.nodes.len(),
            total_edges: self.edges.len(),
            avg_neighbors: if neighbor_counts.is_empty() {
                0.0
            } else {
                neighbor_counts.iter().sum::<usize>() as f64 / neighbor_counts.len() as f64
            },
            max_neighbors: neighbor_counts.iter().copied().max().unwrap_or(0),
            nodes_with_documents: self
                .node_to_docs
                .values()
                .filter(|docs| !docs.is_empty())
                .count(),
            similarity_threshold: self.similarity_threshold,
        }
    }
}

fn edge_key(a: &DocumentId, b: &DocumentId) -> (DocumentId, DocumentId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> SimilarityGraph {
        let mut g = SimilarityGraph::new(0.3, 20);
        g.add_document(DocumentId::from("a"), NodeId::from("n1"), None, vec![]);
        g.add_document(DocumentId::from("b"), NodeId::from("n2"), None, vec![]);
        g.add_document(DocumentId::from("c"), NodeId::from("n2"), None, vec![]);
        g
    }

    #[test]
    fn test_edges_below_threshold_rejected() {
        let mut g = graph();
        assert!(!g.add_similarity(&DocumentId::from("a"), &DocumentId::from("b"), 0.2));
        assert!(g.add_similarity(&DocumentId::from("a"), &DocumentId::from("b"), 0.8));
        assert_eq!(g.similarity(&DocumentId::from("a"), &DocumentId::from("b")), 0.8);
    }

    #[test]
    fn test_edges_stored_once_canonically() {
        let mut g = graph();
        g.add_similarity(&DocumentId::from("b"), &DocumentId::from("a"), 0.7);
        // Lookup works in both directions
        assert_eq!(g.similarity(&DocumentId::from("a"), &DocumentId::from("b")), 0.7);
        assert_eq!(g.statistics().total_edges, 1);
    }

    #[test]
    fn test_neighbor_pruning_keeps_strongest() {
        let mut g = SimilarityGraph::new(0.1, 2);
        for id in ["a", "b", "c", "d"] {
            g.add_document(DocumentId::from(id), NodeId::from("n1"), None, vec![]);
        }
        g.add_similarity(&DocumentId::from("a"), &DocumentId::from("b"), 0.9);
        g.add_similarity(&DocumentId::from("a"), &DocumentId::from("c"), 0.5);
        g.add_similarity(&DocumentId::from("a"), &DocumentId::from("d"), 0.7);

        let neighbors = g.neighbors(&DocumentId::from("a"), 10);
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].0, DocumentId::from("b"));
        assert_eq!(neighbors[1].0, DocumentId::from("d"));
        // Pruned edge disappears from both sides
        assert!(g.neighbors(&DocumentId::from("c"), 10).is_empty());
    }

    #[test]
    fn test_best_replica_nodes_prefers_neighbor_host() {
        let mut g = graph();
        g.add_similarity(&DocumentId::from("a"), &DocumentId::from("b"), 0.9);
        g.add_similarity(&DocumentId::from("a"), &DocumentId::from("c"), 0.6);

        // b and c live on n2, so n2 should win for replicas of a
        let candidates = vec![(NodeId::from("n2"), 0.5), (NodeId::from("n3"), 0.1)];
        let best = g.best_replica_nodes(&DocumentId::from("a"), &candidates, 1);
        assert_eq!(best[0].0, NodeId::from("n2"));
        assert!((best[0].1 - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_best_replica_nodes_ties_break_by_load_then_id() {
        let mut g = graph();
        // No edges: all affinities are zero
        let candidates = vec![
            (NodeId::from("n5"), 0.4),
            (NodeId::from("n3"), 0.1),
            (NodeId::from("n4"), 0.1),
        ];
        let best = g.best_replica_nodes(&DocumentId::from("a"), &candidates, 2);
        assert_eq!(best[0].0, NodeId::from("n3"));
        assert_eq!(best[1].0, NodeId::from("n4"));
    }

    #[test]
    fn test_candidates_holding_document_excluded() {
        let mut g = graph();
        // a's primary is n1
        let candidates = vec![(NodeId::from("n1"), 0.0), (NodeId::from("n3"), 0.9)];
        let best = g.best_replica_nodes(&DocumentId::from("a"), &candidates, 2);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].0, NodeId::from("n3"));
    }

    #[test]
    fn test_remove_document_cleans_edges() {
        let mut g = graph();
        g.add_similarity(&DocumentId::from("a"), &DocumentId::from("b"), 0.8);
        g.remove_document(&DocumentId::from("b"));

        assert!(g.get_document(&DocumentId::from("b")).is_none());
        assert!(g.neighbors(&DocumentId::from("a"), 10).is_empty());
        assert_eq!(g.statistics().total_edges, 0);
        assert!(!g.documents_on_node(&NodeId::from("n2")).contains(&DocumentId::from("b")));
    }

    #[test]
    fn test_location_update_moves_reverse_index() {
        let mut g = graph();
        g.update_document_location(
            &DocumentId::from("a"),
            Some(NodeId::from("n9")),
            Some(vec![NodeId::from("n2")]),
        );

        assert!(g.documents_on_node(&NodeId::from("n9")).contains(&DocumentId::from("a")));
        assert!(!g.documents_on_node(&NodeId::from("n1")).contains(&DocumentId::from("a")));
        assert!(g.documents_on_node(&NodeId::from("n2")).contains(&DocumentId::from("a")));
    }

    #[test]
    fn test_auto_similarity_from_vectors() {
        let mut g = SimilarityGraph::new(0.3, 20);
        g.set_distance_function(Arc::new(|a, b| {
            // Toy distance: 0 when both have the same topic argmax
            let ta = a.topic_distribution.as_ref().unwrap();
            let tb = b.topic_distribution.as_ref().unwrap();
            if ta == tb {
                0.0
            } else {
                1.0
            }
        }));

        let bundle = |topics: Vec<f64>| VectorBundle {
            name_vector: None,
            minhash_signature: None,
            topic_distribution: Some(topics),
        };

        g.add_document(
            DocumentId::from("a"),
            NodeId::from("n1"),
            Some(bundle(vec![1.0, 0.0])),
            vec![],
        );
        g.add_document(
            DocumentId::from("b"),
            NodeId::from("n2"),
            Some(bundle(vec![1.0, 0.0])),
            vec![],
        );
        g.add_document(
            DocumentId::from("c"),
            NodeId::from("n3"),
            Some(bundle(vec![0.0, 1.0])),
            vec![],
        );

        assert_eq!(g.similarity(&DocumentId::from("a"), &DocumentId::from("b")), 1.0);
        assert_eq!(g.similarity(&DocumentId::from("a"), &DocumentId::from("c")), 0.0);
    }
}
