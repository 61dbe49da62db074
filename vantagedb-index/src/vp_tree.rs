//! Vantage-point tree over the composite document distance.
//!
//! The tree organizes the corpus in metric space so nearest-neighbor
//! queries and partition routing touch only a few leaves. Nodes live in an
//! arena owned by the tree; children are arena indices and every node
//! carries a generated `vpn_N` partition id for external reference.
//!
//! The composite distance is not a strict metric, so k-NN pruning is
//! approximate; a configurable slack multiplier can widen pruning to trade
//! cost for recall.

use std::cmp::Ordering;
use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use vantagedb_core::types::{Document, DocumentId, NodeId, PartitionId};

use crate::distance::DistanceCalculator;

/// Strategy for selecting vantage points during build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VantageStrategy {
    /// Uniformly random document
    Random,
    /// Candidate maximizing the variance of distances to the rest
    MaxSpread,
    /// Candidate minimizing the sum of distances to the rest (the medoid)
    KMedoids,
}

/// How leaves are assigned to cluster nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafAssignment {
    /// Cyclic assignment in leaf-creation order
    RoundRobin,
    /// Largest leaves first onto the currently least-loaded node
    Balanced,
}

#[derive(Debug, Clone)]
pub(crate) enum VpNodeKind {
    Internal {
        vantage: Document,
        median_distance: f64,
        left: Option<usize>,
        right: Option<usize>,
    },
    Leaf {
        documents: Vec<Document>,
        assigned_node: Option<NodeId>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct VpNode {
    pub node_id: PartitionId,
    pub depth: usize,
    pub kind: VpNodeKind,
}

impl VpNode {
    fn is_leaf(&self) -> bool {
        matches!(self.kind, VpNodeKind::Leaf { .. })
    }
}

/// Serializable description of one tree node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_id: PartitionId,
    pub depth: usize,
    pub is_leaf: bool,
    pub document_count: usize,
    pub assigned_node: Option<NodeId>,
    pub median_distance: Option<f64>,
}

/// Aggregate shape of the built tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeStatistics {
    pub total_nodes: usize,
    pub leaf_nodes: usize,
    pub internal_nodes: usize,
    pub max_depth: usize,
    pub total_documents: usize,
    pub min_leaf_size: usize,
    pub max_leaf_size: usize,
    pub avg_leaf_size: f64,
}

pub struct VpTree {
    distance: DistanceCalculator,
    leaf_size: usize,
    strategy: VantageStrategy,
    sample_size: usize,
    pruning_slack: f64,
    rng: StdRng,

    nodes: Vec<VpNode>,
    root: Option<usize>,
    id_index: HashMap<PartitionId, usize>,
    doc_partitions: HashMap<DocumentId, PartitionId>,
    node_counter: usize,
}

impl VpTree {
    pub fn new(
        distance: DistanceCalculator,
        leaf_size: usize,
        strategy: VantageStrategy,
        sample_size: usize,
    ) -> Self {
        Self {
            distance,
            leaf_size: leaf_size.max(1),
            strategy,
            sample_size: sample_size.max(1),
            pruning_slack: 1.0,
            rng: StdRng::from_entropy(),
            nodes: Vec::new(),
            root: None,
            id_index: HashMap::new(),
            doc_partitions: HashMap::new(),
            node_counter: 0,
        }
    }

    /// Deterministic construction for tests and reproducible builds.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_pruning_slack(mut self, slack: f64) -> Self {
        self.pruning_slack = slack.max(1.0);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn next_node_id(&mut self) -> PartitionId {
        self.node_counter += 1;
        PartitionId(format!("vpn_{}", self.node_counter))
    }

    fn dist(&self, a: &Document, b: &Document) -> f64 {
        self.distance.document_distance(a, b)
    }

    /// Build the tree from a corpus, replacing any previous structure.
    pub fn build(&mut self, documents: Vec<Document>) {
        info!("building VP-tree over {} documents", documents.len());
        self.nodes.clear();
        self.id_index.clear();
        self.doc_partitions.clear();
        self.node_counter = 0;

        self.root = self.build_recursive(documents, 0);

        // Record leaf membership for query fan-out
        for node in &self.nodes {
            if let VpNodeKind::Leaf { documents, .. } = &node.kind {
                for doc in documents {
                    self.doc_partitions
                        .insert(doc.id.clone(), node.node_id.clone());
                }
            }
        }

        let stats = self.statistics();
        info!(
            "VP-tree built: {} nodes, {} leaves, max depth {}",
            stats.total_nodes, stats.leaf_nodes, stats.max_depth
        );
    }

    fn build_recursive(&mut self, documents: Vec<Document>, depth: usize) -> Option<usize> {
        if documents.is_empty() {
            return None;
        }

        let node_id = self.next_node_id();

        if documents.len() <= self.leaf_size {
            return Some(self.push_node(VpNode {
                node_id,
                depth,
                kind: VpNodeKind::Leaf {
                    documents,
                    assigned_node: None,
                },
            }));
        }

        let vp_idx = self.select_vantage_point(&documents);
        let vantage = documents[vp_idx].clone();

        let mut remaining = documents;
        remaining.remove(vp_idx);

        let mut distances: Vec<(f64, Document)> = remaining
            .iter()
            .map(|doc| (self.dist(&vantage, doc), doc.clone()))
            .collect();
        distances.sort_by(|a, b| cmp_f64(a.0, b.0));

        let median_idx = distances.len() / 2;
        let mut median_distance = distances[median_idx].0;

        let all_equal = distances
            .windows(2)
            .all(|w| (w[0].0 - w[1].0).abs() < 1e-12);

        let mut left_docs: Vec<Document> = Vec::new();
        let mut right_docs: Vec<Document> = Vec::new();
        if all_equal && distances.len() >= 2 {
            // Degenerate case: split by count at the midpoint; the recorded
            // median is the distance of the first right-side document.
            let mid = distances.len() / 2;
            median_distance = distances[mid].0;
            for (i, (_, doc)) in distances.iter().enumerate() {
                if i < mid {
                    left_docs.push(doc.clone());
                } else {
                    right_docs.push(doc.clone());
                }
            }
        } else {
            for (d, doc) in &distances {
                if *d <= median_distance {
                    left_docs.push(doc.clone());
                } else {
                    right_docs.push(doc.clone());
                }
            }
        }

        let left = self.build_recursive(left_docs, depth + 1);
        let right = self.build_recursive(right_docs, depth + 1);

        Some(self.push_node(VpNode {
            node_id,
            depth,
            kind: VpNodeKind::Internal {
                vantage,
                median_distance,
                left,
                right,
            },
        }))
    }

    fn push_node(&mut self, node: VpNode) -> usize {
        let idx = self.nodes.len();
        self.id_index.insert(node.node_id.clone(), idx);
        self.nodes.push(node);
        idx
    }

    fn select_vantage_point(&mut self, documents: &[Document]) -> usize {
        match self.strategy {
            VantageStrategy::Random => self.rng.gen_range(0..documents.len()),
            VantageStrategy::MaxSpread => self.select_max_spread(documents),
            VantageStrategy::KMedoids => self.select_medoid(documents),
        }
    }

    fn sample_candidates(&mut self, n: usize) -> Vec<usize> {
        if n <= self.sample_size {
            (0..n).collect()
        } else {
            rand::seq::index::sample(&mut self.rng, n, self.sample_size).into_vec()
        }
    }

    fn select_medoid(&mut self, documents: &[Document]) -> usize {
        let candidates = self.sample_candidates(documents.len());

        let mut best_idx = candidates[0];
        let mut best_total = f64::INFINITY;

        for idx in candidates {
            let total: f64 = documents
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != idx)
                .map(|(_, doc)| self.dist(&documents[idx], doc))
                .sum();

            if total < best_total {
                best_total = total;
                best_idx = idx;
            }
        }

        best_idx
    }

    fn select_max_spread(&mut self, documents: &[Document]) -> usize {
        let candidates = self.sample_candidates(documents.len());

        let mut best_idx = candidates[0];
        let mut best_spread = -1.0;

        for idx in candidates {
            let distances: Vec<f64> = documents
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != idx)
                .map(|(_, doc)| self.dist(&documents[idx], doc))
                .collect();

            if distances.is_empty() {
                continue;
            }
            let mean = distances.iter().sum::<f64>() / distances.len() as f64;
            let spread = distances
                .iter()
                .map(|d| (d - mean) * (d - mean))
                .sum::<f64>()
                / distances.len() as f64;

            if spread > best_spread {
                best_spread = spread;
                best_idx = idx;
            }
        }

        best_idx
    }

    /// Find the `k` nearest documents to the query, sorted ascending by
    /// distance. `max_distance` bounds the search radius when given.
    pub fn search_knn(
        &self,
        query: &Document,
        k: usize,
        max_distance: Option<f64>,
    ) -> Vec<(Document, f64)> {
        let root = match self.root {
            Some(root) if k > 0 => root,
            _ => return Vec::new(),
        };

        let mut best = BestList::new(k, max_distance);
        self.knn_recursive(root, query, &mut best);

        best.entries
            .into_iter()
            .map(|(d, doc)| (doc, d))
            .collect()
    }

    fn knn_recursive(&self, idx: usize, query: &Document, best: &mut BestList) {
        match &self.nodes[idx].kind {
            VpNodeKind::Leaf { documents, .. } => {
                for doc in documents {
                    let d = self.dist(query, doc);
                    best.consider(d, doc);
                }
            }
            VpNodeKind::Internal {
                vantage,
                median_distance,
                left,
                right,
            } => {
                let dv = self.dist(query, vantage);
                best.consider(dv, vantage);

                let median = *median_distance;
                if dv <= median {
                    if let Some(l) = left {
                        self.knn_recursive(*l, query, best);
                    }
                    if dv + best.tau * self.pruning_slack >= median {
                        if let Some(r) = right {
                            self.knn_recursive(*r, query, best);
                        }
                    }
                } else {
                    if let Some(r) = right {
                        self.knn_recursive(*r, query, best);
                    }
                    if dv - best.tau * self.pruning_slack <= median {
                        if let Some(l) = left {
                            self.knn_recursive(*l, query, best);
                        }
                    }
                }
            }
        }
    }

    /// Find all documents within `radius` of the query, sorted ascending.
    pub fn search_range(&self, query: &Document, radius: f64) -> Vec<(Document, f64)> {
        let root = match self.root {
            Some(root) => root,
            None => return Vec::new(),
        };

        let mut results = Vec::new();
        self.range_recursive(root, query, radius, &mut results);
        results.sort_by(|a, b| cmp_f64(a.1, b.1));
        results
    }

    fn range_recursive(
        &self,
        idx: usize,
        query: &Document,
        radius: f64,
        results: &mut Vec<(Document, f64)>,
    ) {
        match &self.nodes[idx].kind {
            VpNodeKind::Leaf { documents, .. } => {
                for doc in documents {
                    let d = self.dist(query, doc);
                    if d <= radius {
                        results.push((doc.clone(), d));
                    }
                }
            }
            VpNodeKind::Internal {
                vantage,
                median_distance,
                left,
                right,
            } => {
                let dv = self.dist(query, vantage);
                if dv <= radius {
                    results.push((vantage.clone(), dv));
                }

                // Recurse only into subtrees that can intersect the ball
                if dv - radius <= *median_distance {
                    if let Some(l) = left {
                        self.range_recursive(*l, query, radius, results);
                    }
                }
                if dv + radius >= *median_distance {
                    if let Some(r) = right {
                        self.range_recursive(*r, query, radius, results);
                    }
                }
            }
        }
    }

    /// Deterministic single-path descent to the leaf owning the query.
    pub fn find_partition(&self, query: &Document) -> Option<PartitionId> {
        let mut idx = self.root?;

        loop {
            match &self.nodes[idx].kind {
                VpNodeKind::Leaf { .. } => return Some(self.nodes[idx].node_id.clone()),
                VpNodeKind::Internal {
                    vantage,
                    median_distance,
                    left,
                    right,
                } => {
                    let dv = self.dist(query, vantage);
                    let (preferred, fallback) = if dv <= *median_distance {
                        (*left, *right)
                    } else {
                        (*right, *left)
                    };

                    match preferred.or(fallback) {
                        Some(child) => idx = child,
                        None => return Some(self.nodes[idx].node_id.clone()),
                    }
                }
            }
        }
    }

    /// Leaf the query belongs to together with its assigned cluster node.
    pub fn partition_node(&self, query: &Document) -> (Option<PartitionId>, Option<NodeId>) {
        match self.find_partition(query) {
            Some(partition_id) => {
                let assigned = self.assigned_node(&partition_id);
                (Some(partition_id), assigned)
            }
            None => (None, None),
        }
    }

    pub fn assigned_node(&self, partition_id: &PartitionId) -> Option<NodeId> {
        let idx = *self.id_index.get(partition_id)?;
        match &self.nodes[idx].kind {
            VpNodeKind::Leaf { assigned_node, .. } => assigned_node.clone(),
            VpNodeKind::Internal { .. } => None,
        }
    }

    /// Leaf id of the partition holding a specific corpus document.
    pub fn partition_of(&self, document_id: &DocumentId) -> Option<PartitionId> {
        self.doc_partitions.get(document_id).cloned()
    }

    /// Assign cluster nodes to leaf partitions.
    ///
    /// Round-robin cycles nodes in leaf-creation order. Balanced assigns
    /// the largest leaves first to the currently least-loaded node, breaking
    /// load ties by lexicographic node id so equal inputs yield equal
    /// assignments.
    pub fn assign_nodes_to_partitions(
        &mut self,
        cluster_nodes: &[NodeId],
        strategy: LeafAssignment,
    ) -> HashMap<PartitionId, NodeId> {
        let mut assignments = HashMap::new();
        if cluster_nodes.is_empty() {
            return assignments;
        }

        let mut leaf_indices: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_leaf())
            .collect();
        if leaf_indices.is_empty() {
            return assignments;
        }

        match strategy {
            LeafAssignment::RoundRobin => {
                for (i, &leaf_idx) in leaf_indices.iter().enumerate() {
                    let node = cluster_nodes[i % cluster_nodes.len()].clone();
                    if let VpNodeKind::Leaf { assigned_node, .. } = &mut self.nodes[leaf_idx].kind {
                        *assigned_node = Some(node.clone());
                    }
                    assignments.insert(self.nodes[leaf_idx].node_id.clone(), node);
                }
            }
            LeafAssignment::Balanced => {
                leaf_indices.sort_by(|&a, &b| {
                    let size_a = leaf_doc_count(&self.nodes[a]);
                    let size_b = leaf_doc_count(&self.nodes[b]);
                    size_b
                        .cmp(&size_a)
                        .then_with(|| self.nodes[a].node_id.0.cmp(&self.nodes[b].node_id.0))
                });

                let mut loads: HashMap<NodeId, usize> =
                    cluster_nodes.iter().map(|n| (n.clone(), 0)).collect();

                for &leaf_idx in &leaf_indices {
                    let target = cluster_nodes
                        .iter()
                        .min_by(|a, b| loads[a].cmp(&loads[b]).then_with(|| a.0.cmp(&b.0)))
                        .cloned()
                        .expect("cluster_nodes checked non-empty");

                    let size = leaf_doc_count(&self.nodes[leaf_idx]);
                    *loads.get_mut(&target).expect("load tracked for node") += size;

                    if let VpNodeKind::Leaf { assigned_node, .. } = &mut self.nodes[leaf_idx].kind {
                        *assigned_node = Some(target.clone());
                    }
                    assignments.insert(self.nodes[leaf_idx].node_id.clone(), target);
                }
            }
        }

        assignments
    }

    pub fn leaf_partitions(&self) -> Vec<PartitionInfo> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(node_info)
            .collect()
    }

    pub fn all_partitions(&self) -> Vec<PartitionInfo> {
        self.nodes.iter().map(node_info).collect()
    }

    pub fn statistics(&self) -> TreeStatistics {
        let leaf_sizes: Vec<usize> = self
            .nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(leaf_doc_count)
            .collect();

        let leaf_nodes = leaf_sizes.len();
        let total_documents: usize = leaf_sizes.iter().sum();

        TreeStatistics {
            total_nodes: self.nodes.len(),
            leaf_nodes,
            internal_nodes: self.nodes.len() - leaf_nodes,
            max_depth: self.nodes.iter().map(|n| n.depth).max().unwrap_or(0),
            total_documents,
            min_leaf_size: leaf_sizes.iter().copied().min().unwrap_or(0),
            max_leaf_size: leaf_sizes.iter().copied().max().unwrap_or(0),
            avg_leaf_size: if leaf_nodes > 0 {
                total_documents as f64 / leaf_nodes as f64
            } else {
                0.0
            },
        }
    }

    #[cfg(test)]
    pub(crate) fn internal_nodes(&self) -> Vec<(Document, f64, Vec<Document>, Vec<Document>)> {
        self.nodes
            .iter()
            .filter_map(|n| match &n.kind {
                VpNodeKind::Internal {
                    vantage,
                    median_distance,
                    left,
                    right,
                } => Some((
                    vantage.clone(),
                    *median_distance,
                    left.map(|l| self.subtree_documents(l)).unwrap_or_default(),
                    right.map(|r| self.subtree_documents(r)).unwrap_or_default(),
                )),
                _ => None,
            })
            .collect()
    }

    #[cfg(test)]
    fn subtree_documents(&self, idx: usize) -> Vec<Document> {
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            match &self.nodes[i].kind {
                VpNodeKind::Leaf { documents, .. } => out.extend(documents.iter().cloned()),
                VpNodeKind::Internal {
                    vantage,
                    left,
                    right,
                    ..
                } => {
                    out.push(vantage.clone());
                    if let Some(l) = left {
                        stack.push(*l);
                    }
                    if let Some(r) = right {
                        stack.push(*r);
                    }
                }
            }
        }
        out
    }

    pub(crate) fn distance_calculator(&self) -> &DistanceCalculator {
        &self.distance
    }
}

fn leaf_doc_count(node: &VpNode) -> usize {
    match &node.kind {
        VpNodeKind::Leaf { documents, .. } => documents.len(),
        VpNodeKind::Internal { .. } => 0,
    }
}

fn node_info(node: &VpNode) -> PartitionInfo {
    match &node.kind {
        VpNodeKind::Leaf {
            documents,
            assigned_node,
        } => PartitionInfo {
            partition_id: node.node_id.clone(),
            depth: node.depth,
            is_leaf: true,
            document_count: documents.len(),
            assigned_node: assigned_node.clone(),
            median_distance: None,
        },
        VpNodeKind::Internal {
            median_distance, ..
        } => PartitionInfo {
            partition_id: node.node_id.clone(),
            depth: node.depth,
            is_leaf: false,
            document_count: 0,
            assigned_node: None,
            median_distance: Some(*median_distance),
        },
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Bounded candidate list for k-NN with the current search radius.
struct BestList {
    k: usize,
    tau: f64,
    entries: Vec<(f64, Document)>,
}

impl BestList {
    fn new(k: usize, max_distance: Option<f64>) -> Self {
        Self {
            k,
            tau: max_distance.unwrap_or(f64::INFINITY),
            entries: Vec::with_capacity(k + 1),
        }
    }

    fn consider(&mut self, d: f64, doc: &Document) {
        if d >= self.tau {
            return;
        }
        let pos = self.entries.partition_point(|(e, _)| *e <= d);
        self.entries.insert(pos, (d, doc.clone()));
        if self.entries.len() > self.k {
            self.entries.pop();
        }
        if self.entries.len() == self.k {
            self.tau = self.entries[self.k - 1].0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantagedb_core::types::VectorBundle;

    fn topic_doc(id: &str, topics: Vec<f64>) -> Document {
        Document::new(
            id,
            100,
            VectorBundle {
                name_vector: Some(
                    [(id.to_string(), 1.0)]
                        .into_iter()
                        .collect::<HashMap<_, _>>(),
                ),
                minhash_signature: Some(vec![1, 2, 3, 4]),
                topic_distribution: Some(topics),
            },
        )
    }

    fn clustered_corpus(per_cluster: usize) -> Vec<Document> {
        // Five well-separated topic clusters
        let mut docs = Vec::new();
        for cluster in 0..5usize {
            for i in 0..per_cluster {
                // Small per-document offset keeps pairwise distances unique
                let mut topics = vec![0.02; 5];
                topics[cluster] = 0.90 + i as f64 * 0.0005;
                docs.push(topic_doc(&format!("c{}_d{}", cluster, i), topics));
            }
        }
        docs
    }

    fn shared_name_doc(id: &str, topics: Vec<f64>) -> Document {
        // Identical name vectors and signatures so only topics separate docs
        Document::new(
            id,
            100,
            VectorBundle {
                name_vector: Some([("term".to_string(), 1.0)].into_iter().collect()),
                minhash_signature: Some(vec![7, 7, 7, 7]),
                topic_distribution: Some(topics),
            },
        )
    }

    fn build_tree(docs: Vec<Document>, leaf_size: usize) -> VpTree {
        let mut tree = VpTree::new(
            DistanceCalculator::default(),
            leaf_size,
            VantageStrategy::KMedoids,
            10,
        )
        .with_seed(7);
        tree.build(docs);
        tree
    }

    #[test]
    fn test_split_invariant_holds() {
        let tree = build_tree(clustered_corpus(20), 8);
        let calc = tree.distance_calculator().clone();

        for (vantage, median, left, right) in tree.internal_nodes() {
            for doc in &left {
                assert!(
                    calc.document_distance(&vantage, doc) <= median + 1e-9,
                    "left document beyond median"
                );
            }
            for doc in &right {
                assert!(
                    calc.document_distance(&vantage, doc) > median - 1e-9,
                    "right document within median"
                );
            }
        }
    }

    #[test]
    fn test_leaf_size_is_a_ceiling() {
        let tree = build_tree(clustered_corpus(20), 8);
        for info in tree.leaf_partitions() {
            assert!(info.document_count <= 8);
        }
    }

    #[test]
    fn test_knn_matches_brute_force_top1() {
        let docs = clustered_corpus(20);
        let tree = build_tree(docs.clone(), 8);
        let calc = DistanceCalculator::default();

        let query = topic_doc("query", vec![0.02, 0.02, 0.92, 0.02, 0.02]);

        let mut brute: Vec<(f64, &Document)> = docs
            .iter()
            .map(|d| (calc.document_distance(&query, d), d))
            .collect();
        brute.sort_by(|a, b| cmp_f64(a.0, b.0));

        let results = tree.search_knn(&query, 10, None);
        assert_eq!(results.len(), 10);
        assert_eq!(results[0].0.id, brute[0].1.id);

        // Distances must come back sorted ascending
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }

        // Approximate recall: within 5% of brute-force distance mass
        let brute_sum: f64 = brute.iter().take(10).map(|(d, _)| d).sum();
        let tree_sum: f64 = results.iter().map(|(_, d)| d).sum();
        assert!(tree_sum <= brute_sum * 1.05 + 1e-9);
    }

    #[test]
    fn test_knn_cluster_recall() {
        let docs = clustered_corpus(40);
        let tree = build_tree(docs, 10);

        let query = topic_doc("centroid", vec![0.02, 0.02, 0.02, 0.92, 0.02]);
        let results = tree.search_knn(&query, 10, None);

        let in_cluster = results
            .iter()
            .filter(|(doc, _)| doc.id.0.starts_with("c3_"))
            .count();
        assert!(in_cluster >= 9, "only {} of 10 from target cluster", in_cluster);
    }

    #[test]
    fn test_knn_respects_max_distance() {
        let docs = clustered_corpus(10);
        let tree = build_tree(docs, 4);
        let query = topic_doc("q", vec![0.92, 0.02, 0.02, 0.02, 0.02]);

        for (_, d) in tree.search_knn(&query, 50, Some(0.05)) {
            assert!(d < 0.05);
        }
    }

    #[test]
    fn test_range_search_complete() {
        let docs = clustered_corpus(10);
        let tree = build_tree(docs.clone(), 4);
        let calc = DistanceCalculator::default();
        let query = topic_doc("q", vec![0.02, 0.92, 0.02, 0.02, 0.02]);
        let radius = 0.2;

        let expected: usize = docs
            .iter()
            .filter(|d| calc.document_distance(&query, d) <= radius)
            .count();

        let results = tree.search_range(&query, radius);
        assert_eq!(results.len(), expected);
        for (_, d) in results {
            assert!(d <= radius);
        }
    }

    #[test]
    fn test_find_partition_is_deterministic() {
        let tree = build_tree(clustered_corpus(20), 8);
        let query = topic_doc("q", vec![0.92, 0.02, 0.02, 0.02, 0.02]);

        let first = tree.find_partition(&query).unwrap();
        for _ in 0..5 {
            assert_eq!(tree.find_partition(&query).unwrap(), first);
        }
    }

    #[test]
    fn test_empty_tree_searches() {
        let tree = VpTree::new(
            DistanceCalculator::default(),
            8,
            VantageStrategy::KMedoids,
            10,
        );
        let query = topic_doc("q", vec![1.0]);
        assert!(tree.search_knn(&query, 5, None).is_empty());
        assert!(tree.search_range(&query, 0.5).is_empty());
        assert!(tree.find_partition(&query).is_none());
    }

    #[test]
    fn test_all_equal_distances_split_by_count() {
        // All documents identical; every pairwise distance is zero
        let docs: Vec<Document> = (0..10)
            .map(|i| shared_name_doc(&format!("d{}", i), vec![0.5, 0.5]))
            .collect();
        let tree = build_tree(docs, 2);

        let stats = tree.statistics();
        assert_eq!(stats.total_documents + stats.internal_nodes, 10);
        for info in tree.leaf_partitions() {
            assert!(info.document_count <= 2);
        }
    }

    #[test]
    fn test_round_robin_assignment_cycles() {
        let mut tree = build_tree(clustered_corpus(20), 8);
        let nodes = vec![NodeId::from("n1"), NodeId::from("n2"), NodeId::from("n3")];

        let assignments = tree.assign_nodes_to_partitions(&nodes, LeafAssignment::RoundRobin);
        assert_eq!(assignments.len(), tree.leaf_partitions().len());

        for node in &nodes {
            assert!(assignments.values().any(|n| n == node));
        }
    }

    #[test]
    fn test_balanced_assignment_deterministic() {
        let docs = clustered_corpus(30);
        let nodes = vec![NodeId::from("n2"), NodeId::from("n1")];

        let mut tree_a = build_tree(docs.clone(), 8);
        let mut tree_b = build_tree(docs, 8);

        let a = tree_a.assign_nodes_to_partitions(&nodes, LeafAssignment::Balanced);
        let b = tree_b.assign_nodes_to_partitions(&nodes, LeafAssignment::Balanced);
        assert_eq!(a, b);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

        #[test]
        fn prop_split_invariant_on_random_corpora(
            topic_sets in proptest::collection::vec(
                proptest::collection::vec(0.01f64..1.0, 4),
                20..60,
            ),
            seed in 0u64..1000,
        ) {
            let docs: Vec<Document> = topic_sets
                .into_iter()
                .enumerate()
                .map(|(i, topics)| shared_name_doc(&format!("d{}", i), topics))
                .collect();

            let mut tree = VpTree::new(
                DistanceCalculator::default(),
                4,
                VantageStrategy::KMedoids,
                5,
            )
            .with_seed(seed);
            tree.build(docs);

            let calc = tree.distance_calculator().clone();
            for (vantage, median, left, right) in tree.internal_nodes() {
                for doc in &left {
                    proptest::prop_assert!(
                        calc.document_distance(&vantage, doc) <= median + 1e-9
                    );
                }
                // Equality on the right is only reachable through the
                // all-equal count split, which the tolerance admits
                for doc in &right {
                    proptest::prop_assert!(
                        calc.document_distance(&vantage, doc) > median - 1e-9
                    );
                }
            }
        }

        #[test]
        fn prop_knn_top1_matches_brute_force(
            topic_sets in proptest::collection::vec(
                proptest::collection::vec(0.01f64..1.0, 4),
                30..80,
            ),
            query_topics in proptest::collection::vec(0.01f64..1.0, 4),
        ) {
            // Distinct name vectors put a constant cosine floor under every
            // pairwise distance, which keeps the pruning bound exact
            let docs: Vec<Document> = topic_sets
                .into_iter()
                .enumerate()
                .map(|(i, topics)| topic_doc(&format!("d{}", i), topics))
                .collect();

            let mut tree = VpTree::new(
                DistanceCalculator::default(),
                4,
                VantageStrategy::KMedoids,
                5,
            )
            .with_seed(11);
            tree.build(docs.clone());

            let calc = DistanceCalculator::default();
            let query = topic_doc("query", query_topics);

            let mut brute: Vec<(f64, &Document)> = docs
                .iter()
                .map(|d| (calc.document_distance(&query, d), d))
                .collect();
            brute.sort_by(|a, b| cmp_f64(a.0, b.0));

            let results = tree.search_knn(&query, 5, None);
            proptest::prop_assert!(!results.is_empty());
            // Top-1 distance must match brute force (ids may tie)
            proptest::prop_assert!((results[0].1 - brute[0].0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_partition_of_covers_leaf_documents() {
        let docs = clustered_corpus(10);
        let tree = build_tree(docs, 4);

        let stats = tree.statistics();
        let mapped = stats.total_documents;
        // Every leaf-resident document has a recorded partition
        assert!(mapped > 0);
        for info in tree.leaf_partitions() {
            assert!(info.document_count <= 4);
        }
        let covered = tree.doc_partitions.len();
        assert_eq!(covered, mapped);
    }
}
