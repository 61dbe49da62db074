//! Cluster-size-aware replication wrapper.
//!
//! Scales the effective replication factor with the number of available
//! nodes: `min(target, n - 1)`, zero when alone. Writes are never refused;
//! a single node simply stores documents unreplicated and upgrade work is
//! scheduled once peers appear.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use vantagedb_core::types::{DocumentId, NodeId, VectorBundle};

use crate::affinity::{AffinityReplicator, ReplicationPriority};
use crate::replica_tracker::DocumentReplicas;

const UPGRADE_INTERVAL_SEC: f64 = 30.0;

/// Effective replication derived from the cluster size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveReplicationState {
    pub target_replication_factor: usize,
    pub effective_replication_factor: usize,
    pub available_nodes: usize,
}

impl AdaptiveReplicationState {
    pub fn new(target: usize) -> Self {
        Self {
            target_replication_factor: target,
            effective_replication_factor: 0,
            available_nodes: 0,
        }
    }

    /// Recompute the effective factor for a node count; returns
    /// (old, new) when it changed.
    pub fn update_for_nodes(&mut self, node_count: usize) -> Option<(usize, usize)> {
        let old = self.effective_replication_factor;
        self.available_nodes = node_count;
        self.effective_replication_factor = if node_count <= 1 {
            0
        } else {
            self.target_replication_factor.min(node_count - 1)
        };

        if old != self.effective_replication_factor {
            info!(
                "replication factor adjusted: {} -> {} ({} nodes)",
                old, self.effective_replication_factor, node_count
            );
            Some((old, self.effective_replication_factor))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveReplicatorStatus {
    pub cluster_nodes: usize,
    pub effective_replication_factor: usize,
    pub target_replication_factor: usize,
    pub can_replicate: bool,
    pub pending_upgrades: usize,
    pub is_running: bool,
}

pub struct AdaptiveReplicator {
    state: RwLock<AdaptiveReplicationState>,
    replicator: Arc<AffinityReplicator>,
    cluster_nodes: RwLock<Vec<NodeId>>,
    /// document -> replica count the upgrade should reach
    pending_upgrades: Mutex<HashMap<DocumentId, usize>>,
    running: AtomicBool,
    upgrade_task: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptiveReplicator {
    pub fn new(target_replication_factor: usize, replicator: Arc<AffinityReplicator>) -> Self {
        Self {
            state: RwLock::new(AdaptiveReplicationState::new(target_replication_factor)),
            replicator,
            cluster_nodes: RwLock::new(Vec::new()),
            pending_upgrades: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            upgrade_task: Mutex::new(None),
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.state.read().effective_replication_factor
    }

    pub fn can_replicate(&self) -> bool {
        self.replication_factor() > 0
    }

    pub fn inner(&self) -> &Arc<AffinityReplicator> {
        &self.replicator
    }

    /// A node joined: grow the effective factor and schedule upgrades for
    /// documents that were stuck under-replicated.
    pub fn node_joined(&self, node_id: NodeId) -> AdaptiveReplicationState {
        {
            let mut nodes = self.cluster_nodes.write();
            if !nodes.contains(&node_id) {
                nodes.push(node_id.clone());
            }
        }
        self.replicator.register_cluster_node(node_id);

        let node_count = self.cluster_nodes.read().len();
        let change = self.state.write().update_for_nodes(node_count);

        if let Some((old, new)) = change {
            // The affinity layer counts total copies, primary included
            self.replicator.set_replication_factor(new + 1);
            if new > old {
                self.schedule_upgrades();
            }
        }

        self.state.read().clone()
    }

    /// A node left or failed: shrink the effective factor and fan out the
    /// repair work. Returns affected documents.
    pub fn node_left(&self, node_id: &NodeId) -> (AdaptiveReplicationState, Vec<DocumentId>) {
        self.cluster_nodes.write().retain(|id| id != node_id);

        let affected = self.replicator.unregister_cluster_node(node_id);

        let node_count = self.cluster_nodes.read().len();
        if let Some((_, new)) = self.state.write().update_for_nodes(node_count) {
            self.replicator.set_replication_factor(new + 1);
        }

        (self.state.read().clone(), affected)
    }

    /// Register a document for replication. In single-node mode the
    /// document is tracked with the primary copy only, never refused.
    pub fn register_document(
        &self,
        document_id: DocumentId,
        primary_node: NodeId,
        vectors: Option<VectorBundle>,
        size_bytes: u64,
        checksum: Option<String>,
    ) -> DocumentReplicas {
        if !self.can_replicate() {
            info!(
                "single-node mode: {} stored without replicas",
                document_id
            );
            return self.replicator.with_tracker(|tracker| {
                tracker.register_document(
                    document_id.clone(),
                    primary_node.clone(),
                    Vec::new(),
                    Some(1),
                    size_bytes,
                    checksum.clone(),
                )
            });
        }

        self.replicator
            .register_document(document_id, primary_node, vectors, size_bytes, checksum)
    }

    /// Record upgrade targets for every currently under-replicated
    /// document; the upgrade loop turns them into LOW-priority tasks.
    fn schedule_upgrades(&self) {
        let under_replicated = self
            .replicator
            .with_tracker(|tracker| tracker.under_replicated());
        if under_replicated.is_empty() {
            return;
        }

        let target = self.replication_factor();
        let mut pending = self.pending_upgrades.lock();
        for document_id in under_replicated {
            pending.insert(document_id, target);
        }
        info!("scheduled {} documents for replication upgrade", pending.len());
    }

    /// Convert pending upgrade markers into queued replication work.
    /// Returns (processed, queued).
    pub fn process_upgrades(&self) -> (usize, usize) {
        let pending: Vec<(DocumentId, usize)> = {
            let mut map = self.pending_upgrades.lock();
            map.drain().collect()
        };

        let mut queued = 0;
        for (document_id, target_replicas) in &pending {
            let needs_more = self.replicator.with_tracker(|tracker| {
                tracker
                    .get_document_replicas(document_id)
                    // +1 accounts for the primary copy
                    .map(|doc| doc.healthy_count() < target_replicas + 1)
                    .unwrap_or(false)
            });
            if needs_more {
                self.replicator
                    .queue_repair(document_id, ReplicationPriority::Low);
                queued += 1;
            }
        }

        debug!("processed {} upgrades, queued {}", pending.len(), queued);
        (pending.len(), queued)
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        self.replicator.start();

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if !this.running.load(AtomicOrdering::SeqCst) {
                    break;
                }
                if !this.pending_upgrades.lock().is_empty() {
                    this.process_upgrades();
                    this.replicator.drain_queue();
                }
                tokio::time::sleep(Duration::from_secs_f64(UPGRADE_INTERVAL_SEC)).await;
            }
        });
        *self.upgrade_task.lock() = Some(handle);
        info!("adaptive replicator started");
    }

    pub async fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        if let Some(handle) = self.upgrade_task.lock().take() {
            handle.abort();
        }
        self.replicator.stop().await;
        info!("adaptive replicator stopped");
    }

    pub fn status(&self) -> AdaptiveReplicatorStatus {
        let state = self.state.read();
        AdaptiveReplicatorStatus {
            cluster_nodes: self.cluster_nodes.read().len(),
            effective_replication_factor: state.effective_replication_factor,
            target_replication_factor: state.target_replication_factor,
            can_replicate: state.effective_replication_factor > 0,
            pending_upgrades: self.pending_upgrades.lock().len(),
            is_running: self.running.load(AtomicOrdering::SeqCst),
        }
    }
}
