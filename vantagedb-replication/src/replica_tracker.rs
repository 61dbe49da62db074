//! Authoritative record of where every document's copies live.
//!
//! For each document the tracker keeps one primary plus replicas, each with
//! a status and a monotonic version counter. The tracker maintains the
//! at-most-one-active-primary invariant and an index of under-replicated
//! documents for the repair machinery.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vantagedb_core::snapshot::ReplicaSetSnapshot;
use vantagedb_core::types::{DocumentId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Pending,
    Syncing,
    Active,
    Stale,
    Failed,
}

impl ReplicaStatus {
    /// Replicas counted toward replication health.
    pub fn is_healthy(&self) -> bool {
        matches!(self, ReplicaStatus::Active | ReplicaStatus::Syncing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub document_id: DocumentId,
    pub node_id: NodeId,
    pub is_primary: bool,
    pub status: ReplicaStatus,
    pub version: u64,
    pub last_sync: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksum: Option<String>,
}

impl ReplicaInfo {
    fn new(document_id: DocumentId, node_id: NodeId, is_primary: bool, status: ReplicaStatus) -> Self {
        let now = Utc::now();
        Self {
            document_id,
            node_id,
            is_primary,
            status,
            version: 1,
            last_sync: now,
            created_at: now,
            size_bytes: 0,
            checksum: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

/// All copies of one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReplicas {
    pub document_id: DocumentId,
    pub primary: Option<ReplicaInfo>,
    pub replicas: Vec<ReplicaInfo>,
    pub replication_factor: usize,
    pub created_at: DateTime<Utc>,
}

impl DocumentReplicas {
    pub fn all_replicas(&self) -> Vec<&ReplicaInfo> {
        self.primary.iter().chain(self.replicas.iter()).collect()
    }

    pub fn all_nodes(&self) -> Vec<NodeId> {
        self.all_replicas().iter().map(|r| r.node_id.clone()).collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.all_replicas().iter().filter(|r| r.is_healthy()).count()
    }

    pub fn is_under_replicated(&self) -> bool {
        self.healthy_count() < self.replication_factor
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerStatistics {
    pub total_documents: usize,
    pub total_replicas: usize,
    pub under_replicated_count: usize,
    pub avg_replicas_per_doc: f64,
    pub nodes_with_replicas: usize,
    pub status_distribution: HashMap<String, usize>,
    pub default_replication_factor: usize,
}

pub struct ReplicaTracker {
    default_replication_factor: usize,
    documents: HashMap<DocumentId, DocumentReplicas>,
    node_replicas: HashMap<NodeId, HashSet<DocumentId>>,
    under_replicated: HashSet<DocumentId>,
}

impl ReplicaTracker {
    pub fn new(default_replication_factor: usize) -> Self {
        Self {
            default_replication_factor,
            documents: HashMap::new(),
            node_replicas: HashMap::new(),
            under_replicated: HashSet::new(),
        }
    }

    pub fn set_default_replication_factor(&mut self, factor: usize) {
        self.default_replication_factor = factor;
    }

    /// Register a new document: the primary starts ACTIVE, replicas start
    /// SYNCING until their copy lands.
    pub fn register_document(
        &mut self,
        document_id: DocumentId,
        primary_node: NodeId,
        replica_nodes: Vec<NodeId>,
        replication_factor: Option<usize>,
        size_bytes: u64,
        checksum: Option<String>,
    ) -> DocumentReplicas {
        let replication_factor = replication_factor.unwrap_or(self.default_replication_factor);

        let mut primary = ReplicaInfo::new(
            document_id.clone(),
            primary_node.clone(),
            true,
            ReplicaStatus::Active,
        );
        primary.size_bytes = size_bytes;
        primary.checksum = checksum.clone();

        let replicas: Vec<ReplicaInfo> = replica_nodes
            .iter()
            .map(|node_id| {
                let mut info = ReplicaInfo::new(
                    document_id.clone(),
                    node_id.clone(),
                    false,
                    ReplicaStatus::Syncing,
                );
                info.size_bytes = size_bytes;
                info.checksum = checksum.clone();
                info
            })
            .collect();

        let doc = DocumentReplicas {
            document_id: document_id.clone(),
            primary: Some(primary),
            replicas,
            replication_factor,
            created_at: Utc::now(),
        };

        self.node_replicas
            .entry(primary_node)
            .or_default()
            .insert(document_id.clone());
        for node_id in replica_nodes {
            self.node_replicas
                .entry(node_id)
                .or_default()
                .insert(document_id.clone());
        }

        if doc.is_under_replicated() {
            self.under_replicated.insert(document_id.clone());
        }

        debug!(
            "registered {} with {} replicas",
            document_id,
            doc.replicas.len()
        );
        self.documents.insert(document_id.clone(), doc);
        self.documents[&document_id].clone()
    }

    /// Add a replica in PENDING state. Rejected when the document is
    /// unknown or the node already holds a copy.
    pub fn add_replica(&mut self, document_id: &DocumentId, node_id: NodeId) -> Option<ReplicaInfo> {
        let doc = match self.documents.get_mut(document_id) {
            Some(doc) => doc,
            None => {
                warn!("add_replica for unknown document {}", document_id);
                return None;
            }
        };

        if doc.all_nodes().contains(&node_id) {
            warn!("replica of {} already on {}", document_id, node_id);
            return None;
        }

        let mut replica = ReplicaInfo::new(
            document_id.clone(),
            node_id.clone(),
            false,
            ReplicaStatus::Pending,
        );
        if let Some(primary) = &doc.primary {
            replica.size_bytes = primary.size_bytes;
            replica.checksum = primary.checksum.clone();
        }
        doc.replicas.push(replica.clone());

        self.node_replicas
            .entry(node_id)
            .or_default()
            .insert(document_id.clone());
        self.refresh_under_replication(document_id);

        Some(replica)
    }

    /// Remove a (non-primary) replica from a node.
    pub fn remove_replica(&mut self, document_id: &DocumentId, node_id: &NodeId) -> bool {
        let Some(doc) = self.documents.get_mut(document_id) else {
            return false;
        };

        if doc
            .primary
            .as_ref()
            .map(|p| &p.node_id == node_id)
            .unwrap_or(false)
        {
            warn!("refusing to remove primary replica of {}", document_id);
            return false;
        }

        let before = doc.replicas.len();
        doc.replicas.retain(|r| &r.node_id != node_id);
        if doc.replicas.len() == before {
            return false;
        }

        if let Some(docs) = self.node_replicas.get_mut(node_id) {
            docs.remove(document_id);
        }
        self.refresh_under_replication(document_id);
        true
    }

    pub fn update_replica_status(
        &mut self,
        document_id: &DocumentId,
        node_id: &NodeId,
        status: ReplicaStatus,
        version: Option<u64>,
    ) -> bool {
        let Some(doc) = self.documents.get_mut(document_id) else {
            return false;
        };

        let replica = doc
            .primary
            .iter_mut()
            .chain(doc.replicas.iter_mut())
            .find(|r| &r.node_id == node_id);

        match replica {
            Some(replica) => {
                replica.status = status;
                replica.last_sync = Utc::now();
                if let Some(version) = version {
                    replica.version = version;
                }
                self.refresh_under_replication(document_id);
                true
            }
            None => false,
        }
    }

    /// Promote the replica on the given node to primary, demoting the old
    /// primary into the replica list.
    pub fn promote_replica_to_primary(
        &mut self,
        document_id: &DocumentId,
        new_primary_node: &NodeId,
    ) -> bool {
        let Some(doc) = self.documents.get_mut(document_id) else {
            return false;
        };

        let Some(idx) = doc.replicas.iter().position(|r| &r.node_id == new_primary_node) else {
            warn!(
                "no replica of {} on {} to promote",
                document_id, new_primary_node
            );
            return false;
        };

        if let Some(mut old_primary) = doc.primary.take() {
            old_primary.is_primary = false;
            doc.replicas.push(old_primary);
        }

        let mut promoted = doc.replicas.remove(idx);
        promoted.is_primary = true;
        promoted.status = ReplicaStatus::Active;
        promoted.version += 1;
        doc.primary = Some(promoted);

        info!(
            "promoted replica on {} to primary for {}",
            new_primary_node, document_id
        );
        true
    }

    /// Choose and promote the best surviving replica: ACTIVE replicas
    /// first, ordered by node id. Returns the promoted node.
    pub fn promote_best_replica(&mut self, document_id: &DocumentId) -> Option<NodeId> {
        let candidate = {
            let doc = self.documents.get(document_id)?;
            let mut healthy: Vec<&ReplicaInfo> = doc
                .replicas
                .iter()
                .filter(|r| r.status == ReplicaStatus::Active)
                .collect();
            healthy.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            healthy.first().map(|r| r.node_id.clone())?
        };

        if self.promote_replica_to_primary(document_id, &candidate) {
            Some(candidate)
        } else {
            None
        }
    }

    /// Mark every replica on a node FAILED. Returns the affected documents.
    pub fn mark_node_failed(&mut self, node_id: &NodeId) -> Vec<DocumentId> {
        let doc_ids: Vec<DocumentId> = self
            .node_replicas
            .get(node_id)
            .map(|docs| docs.iter().cloned().collect())
            .unwrap_or_default();

        for document_id in &doc_ids {
            if let Some(doc) = self.documents.get_mut(document_id) {
                for replica in doc.primary.iter_mut().chain(doc.replicas.iter_mut()) {
                    if &replica.node_id == node_id {
                        replica.status = ReplicaStatus::Failed;
                    }
                }
            }
            self.refresh_under_replication(document_id);
        }

        warn!("marked {} replicas failed on {}", doc_ids.len(), node_id);
        doc_ids
    }

    fn refresh_under_replication(&mut self, document_id: &DocumentId) {
        if let Some(doc) = self.documents.get(document_id) {
            if doc.is_under_replicated() {
                self.under_replicated.insert(document_id.clone());
            } else {
                self.under_replicated.remove(document_id);
            }
        }
    }

    pub fn get_document_replicas(&self, document_id: &DocumentId) -> Option<&DocumentReplicas> {
        self.documents.get(document_id)
    }

    pub fn replicas_on_node(&self, node_id: &NodeId) -> Vec<ReplicaInfo> {
        let Some(doc_ids) = self.node_replicas.get(node_id) else {
            return Vec::new();
        };
        doc_ids
            .iter()
            .filter_map(|doc_id| self.documents.get(doc_id))
            .flat_map(|doc| doc.all_replicas().into_iter().cloned().collect::<Vec<_>>())
            .filter(|r| &r.node_id == node_id)
            .collect()
    }

    /// Documents on a node (primary or replica).
    pub fn documents_on_node(&self, node_id: &NodeId) -> Vec<DocumentId> {
        self.node_replicas
            .get(node_id)
            .map(|docs| docs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn node_document_count(&self, node_id: &NodeId) -> usize {
        self.node_replicas
            .get(node_id)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    pub fn under_replicated(&self) -> Vec<DocumentId> {
        self.under_replicated.iter().cloned().collect()
    }

    pub fn documents_needing_replication(&self, limit: usize) -> Vec<&DocumentReplicas> {
        self.under_replicated
            .iter()
            .take(limit)
            .filter_map(|doc_id| self.documents.get(doc_id))
            .filter(|doc| doc.is_under_replicated())
            .collect()
    }

    pub fn statistics(&self) -> TrackerStatistics {
        let total_docs = self.documents.len();
        let mut total_replicas = 0;
        let mut status_distribution: HashMap<String, usize> = HashMap::new();

        for doc in self.documents.values() {
            for replica in doc.all_replicas() {
                total_replicas += 1;
                *status_distribution
                    .entry(format!("{:?}", replica.status).to_lowercase())
                    .or_default() += 1;
            }
        }

        TrackerStatistics {
            total_documents: total_docs,
            total_replicas,
            under_replicated_count: self.under_replicated.len(),
            avg_replicas_per_doc: if total_docs > 0 {
                total_replicas as f64 / total_docs as f64
            } else {
                0.0
            },
            nodes_with_replicas: self
                .node_replicas
                .values()
                .filter(|docs| !docs.is_empty())
                .count(),
            status_distribution,
            default_replication_factor: self.default_replication_factor,
        }
    }

    /// Snapshot for persistence.
    pub fn export_state(&self) -> HashMap<DocumentId, ReplicaSetSnapshot> {
        self.documents
            .iter()
            .map(|(doc_id, doc)| {
                (
                    doc_id.clone(),
                    ReplicaSetSnapshot {
                        primary: doc.primary.as_ref().map(|p| p.node_id.clone()),
                        replicas: doc.replicas.iter().map(|r| r.node_id.clone()).collect(),
                        replication_factor: doc.replication_factor,
                    },
                )
            })
            .collect()
    }
}
