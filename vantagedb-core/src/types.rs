use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Document identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

/// Cluster node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

/// Partition identifier (a VP-tree leaf)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub String);

/// Precomputed vector representations of a document.
///
/// Vectorization (TF-IDF, MinHash, LDA) happens outside the core; the core
/// only consumes the resulting bundle. Any component may be absent, in which
/// case it contributes its maximum distance during comparison.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorBundle {
    /// Sparse TF-IDF vector over document name terms (term -> weight)
    pub name_vector: Option<HashMap<String, f64>>,
    /// MinHash signature of the content; fixed length across the corpus
    pub minhash_signature: Option<Vec<u64>>,
    /// Dense LDA topic distribution summing to 1
    pub topic_distribution: Option<Vec<f64>>,
}

/// Document as seen by the placement and search core.
///
/// Documents are immutable here; a new version is a new `DocumentId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub vectors: VectorBundle,
}

impl Document {
    pub fn new(id: impl Into<DocumentId>, size_bytes: u64, vectors: VectorBundle) -> Self {
        Self {
            id: id.into(),
            size_bytes,
            checksum: None,
            vectors,
        }
    }

    /// Attach a blake3 checksum computed from raw content bytes.
    pub fn with_checksum(mut self, content: &[u8]) -> Self {
        self.checksum = Some(blake3::hash(content).to_hex().to_string());
        self
    }
}

/// Health of a cluster node as tracked by membership and failure detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealthStatus {
    Healthy,
    Suspect,
    Failed,
    Recovering,
    Unknown,
}

/// Optional resource metrics reported alongside heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub storage_used_bytes: u64,
    pub storage_capacity_bytes: u64,
}

/// Membership record for a storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: NodeId,
    pub address: String,
    /// Maximum number of documents this node will hold
    pub capacity: usize,
    pub document_count: usize,
    pub health: NodeHealthStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub resources: Option<ResourceMetrics>,
}

impl ClusterNode {
    pub fn new(node_id: impl Into<NodeId>, address: impl Into<String>, capacity: usize) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            capacity,
            document_count: 0,
            health: NodeHealthStatus::Unknown,
            last_heartbeat: None,
            resources: None,
        }
    }

    /// Document load factor in [0, 1]; a zero-capacity node reads as full.
    pub fn load_factor(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.document_count as f64 / self.capacity as f64
    }

    pub fn available_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.document_count)
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.health, NodeHealthStatus::Healthy)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        DocumentId(s)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for PartitionId {
    fn from(s: String) -> Self {
        PartitionId(s)
    }
}

impl From<&str> for PartitionId {
    fn from(s: &str) -> Self {
        PartitionId(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_factor() {
        let mut node = ClusterNode::new("n1", "localhost:7001", 100);
        assert_eq!(node.load_factor(), 0.0);
        assert_eq!(node.available_capacity(), 100);

        node.document_count = 25;
        assert_eq!(node.load_factor(), 0.25);
        assert_eq!(node.available_capacity(), 75);

        node.document_count = 150;
        assert_eq!(node.available_capacity(), 0);
    }

    #[test]
    fn test_zero_capacity_is_full() {
        let node = ClusterNode::new("n1", "localhost:7001", 0);
        assert_eq!(node.load_factor(), 1.0);
        assert_eq!(node.available_capacity(), 0);
    }

    #[test]
    fn test_document_checksum() {
        let doc = Document::new("doc-1", 42, VectorBundle::default()).with_checksum(b"content");
        assert!(doc.checksum.is_some());

        let same = Document::new("doc-2", 42, VectorBundle::default()).with_checksum(b"content");
        assert_eq!(doc.checksum, same.checksum);
    }

    #[test]
    fn test_node_id_ordering() {
        let mut ids = vec![NodeId::from("n3"), NodeId::from("n1"), NodeId::from("n2")];
        ids.sort();
        assert_eq!(ids[0], NodeId::from("n1"));
        assert_eq!(ids[2], NodeId::from("n3"));
    }

    #[test]
    fn test_document_id_from_str() {
        let id: DocumentId = "doc_1".into();
        assert_eq!(id.0, "doc_1");
        assert_eq!(format!("{}", id), "doc_1");
    }
}
