//! Affinity-driven replication manager.
//!
//! New documents get their replicas placed next to semantically similar
//! content via the similarity graph. Replication work flows through a
//! strict priority queue (FIFO within a priority) drained by a bounded
//! worker pool; failed transfers retry with linear backoff before being
//! counted as failures.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vantagedb_core::callbacks::ReplicateFn;
use vantagedb_core::events::{ClusterEvent, EventBus};
use vantagedb_core::types::{DocumentId, NodeId, VectorBundle};

use crate::replica_tracker::{DocumentReplicas, ReplicaStatus, ReplicaTracker};
use crate::similarity_graph::SimilarityGraph;

/// Priority classes for replication tasks, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplicationPriority {
    /// Background optimization
    Low = 1,
    /// New document
    Normal = 2,
    /// Under-replicated
    High = 3,
    /// Primary lost, no replicas
    Critical = 4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub task_id: String,
    pub document_id: DocumentId,
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub priority: ReplicationPriority,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Queue entry ordering: priority descending, then insertion order.
struct QueuedTask {
    priority: ReplicationPriority,
    seq: u64,
    task: ReplicationTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    pub replication_factor: usize,
    pub max_concurrent_replications: usize,
    pub replication_timeout_sec: f64,
    pub retry_count: u32,
    pub retry_delay_sec: f64,
    pub check_interval_sec: f64,
    pub similarity_threshold: f64,
    pub max_neighbors: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            replication_factor: 2,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorStatistics {
    pub is_running: bool,
    pub pending_tasks: usize,
    pub total_replications: u64,
    pub failed_replications: u64,
    pub cluster_nodes: usize,
    pub under_replicated: usize,
}

pub struct AffinityReplicator {
    settings: RwLock<ReplicationSettings>,
    replicate_fn: RwLock<Option<ReplicateFn>>,

    pub(crate) graph: RwLock<SimilarityGraph>,
    pub(crate) tracker: Mutex<ReplicaTracker>,

    queue: Mutex<BinaryHeap<QueuedTask>>,
    seq_counter: AtomicU64,
    worker_slots: Arc<Semaphore>,

    /// node id -> last known load factor, for placement tie-breaking
    cluster_nodes: RwLock<Vec<(NodeId, f64)>>,

    running: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,

    total_replications: AtomicU64,
    failed_replications: AtomicU64,
}

impl AffinityReplicator {
    pub fn new(settings: ReplicationSettings, events: EventBus) -> Self {
        let graph = SimilarityGraph::new(settings.similarity_threshold, settings.max_neighbors);
        let tracker = ReplicaTracker::new(settings.replication_factor);
        let worker_slots = Arc::new(Semaphore::new(settings.max_concurrent_replications));

        Self {
            settings: RwLock::new(settings),
            replicate_fn: RwLock::new(None),
            graph: RwLock::new(graph),
            tracker: Mutex::new(tracker),
            queue: Mutex::new(BinaryHeap::new()),
            seq_counter: AtomicU64::new(0),
            worker_slots,
            cluster_nodes: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            monitor: Mutex::new(None),
            events,
            total_replications: AtomicU64::new(0),
            failed_replications: AtomicU64::new(0),
        }
    }

    pub fn set_replicate_function(&self, f: ReplicateFn) {
        *self.replicate_fn.write() = Some(f);
    }

    pub fn set_distance_function(&self, f: crate::similarity_graph::BundleDistanceFn) {
        self.graph.write().set_distance_function(f);
    }

    pub fn set_replication_factor(&self, factor: usize) {
        self.settings.write().replication_factor = factor;
        self.tracker.lock().set_default_replication_factor(factor);
    }

    pub fn register_cluster_node(&self, node_id: NodeId) {
        let mut nodes = self.cluster_nodes.write();
        if !nodes.iter().any(|(id, _)| id == &node_id) {
            info!("replication target registered: {}", node_id);
            nodes.push((node_id, 0.0));
        }
    }

    pub fn update_node_load(&self, node_id: &NodeId, load_factor: f64) {
        let mut nodes = self.cluster_nodes.write();
        if let Some(entry) = nodes.iter_mut().find(|(id, _)| id == node_id) {
            entry.1 = load_factor;
        }
    }

    /// Drop a node from the replica target set, mark its replicas failed
    /// and queue HIGH-priority repairs. Returns affected document ids.
    pub fn unregister_cluster_node(&self, node_id: &NodeId) -> Vec<DocumentId> {
        self.cluster_nodes.write().retain(|(id, _)| id != node_id);

        let affected = self.tracker.lock().mark_node_failed(node_id);
        for document_id in &affected {
            self.queue_repair(document_id, ReplicationPriority::High);
        }
        affected
    }

    /// Register a document, choose replica targets by affinity and enqueue
    /// the replication tasks.
    ///
    /// The document enters the similarity graph before target selection so
    /// its freshly computed neighborhood can steer the placement.
    pub fn register_document(
        &self,
        document_id: DocumentId,
        primary_node: NodeId,
        vectors: Option<VectorBundle>,
        size_bytes: u64,
        checksum: Option<String>,
    ) -> DocumentReplicas {
        let had_vectors = vectors.is_some();
        self.graph.write().add_document(
            document_id.clone(),
            primary_node.clone(),
            vectors,
            Vec::new(),
        );

        let replica_nodes = self.select_replica_nodes(&document_id, &primary_node, had_vectors);

        let doc = self.tracker.lock().register_document(
            document_id.clone(),
            primary_node.clone(),
            replica_nodes.clone(),
            None,
            size_bytes,
            checksum,
        );

        self.graph.write().update_document_location(
            &document_id,
            None,
            Some(replica_nodes.clone()),
        );

        for target in &replica_nodes {
            self.enqueue(ReplicationTask {
                task_id: format!("repl_{}", Uuid::new_v4().simple()),
                document_id: document_id.clone(),
                source_node: primary_node.clone(),
                target_node: target.clone(),
                priority: ReplicationPriority::Normal,
                created_at: Utc::now(),
                attempts: 0,
            });
        }

        info!(
            "registered {} with {} pending replicas",
            document_id,
            replica_nodes.len()
        );
        doc
    }

    /// Replica target selection: affinity scores from the similarity graph
    /// with load and node-id tie-breaking; least-loaded fallback when the
    /// graph offers no signal.
    fn select_replica_nodes(
        &self,
        document_id: &DocumentId,
        primary_node: &NodeId,
        has_vectors: bool,
    ) -> Vec<NodeId> {
        let settings = self.settings.read();
        let num_replicas = settings.replication_factor.saturating_sub(1);
        drop(settings);
        if num_replicas == 0 {
            return Vec::new();
        }

        let candidates: Vec<(NodeId, f64)> = self
            .cluster_nodes
            .read()
            .iter()
            .filter(|(id, _)| id != primary_node)
            .cloned()
            .collect();
        if candidates.is_empty() {
            warn!("no candidate nodes for replicas of {}", document_id);
            return Vec::new();
        }

        if has_vectors && self.graph.read().len() > 1 {
            let scored = self
                .graph
                .read()
                .best_replica_nodes(document_id, &candidates, num_replicas);
            let any_signal = scored.iter().any(|(_, affinity)| *affinity > 0.0);
            if any_signal {
                return scored.into_iter().map(|(id, _)| id).collect();
            }
        }

        // No affinity signal: least-loaded nodes, stable by id
        let mut fallback = candidates;
        fallback.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        fallback
            .into_iter()
            .take(num_replicas)
            .map(|(id, _)| id)
            .collect()
    }

    fn enqueue(&self, task: ReplicationTask) {
        let seq = self.seq_counter.fetch_add(1, AtomicOrdering::SeqCst);
        self.queue.lock().push(QueuedTask {
            priority: task.priority,
            seq,
            task,
        });
    }

    /// Queue repair work for an under-replicated document.
    pub fn queue_repair(&self, document_id: &DocumentId, priority: ReplicationPriority) {
        let tracker = self.tracker.lock();
        let Some(doc) = tracker.get_document_replicas(document_id) else {
            return;
        };
        if !doc.is_under_replicated() {
            return;
        }

        let source_node = doc
            .all_replicas()
            .into_iter()
            .find(|r| r.is_healthy())
            .map(|r| r.node_id.clone());
        let Some(source_node) = source_node else {
            error!("no healthy replica of {} to repair from", document_id);
            return;
        };

        let current: Vec<NodeId> = doc.all_nodes();
        let needed = doc.replication_factor.saturating_sub(doc.healthy_count());
        drop(tracker);

        let targets: Vec<NodeId> = {
            let nodes = self.cluster_nodes.read();
            let mut available: Vec<(NodeId, f64)> = nodes
                .iter()
                .filter(|(id, _)| !current.contains(id))
                .cloned()
                .collect();
            available.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            available.into_iter().take(needed).map(|(id, _)| id).collect()
        };

        for target in targets {
            self.enqueue(ReplicationTask {
                task_id: format!("repl_{}", Uuid::new_v4().simple()),
                document_id: document_id.clone(),
                source_node: source_node.clone(),
                target_node: target,
                priority,
                created_at: Utc::now(),
                attempts: 0,
            });
        }
    }

    /// Handle a node failure: unregister, promote where the failed node was
    /// primary, repairs are queued by the unregistration. Returns affected
    /// document count.
    pub fn handle_node_failure(&self, node_id: &NodeId) -> usize {
        let affected = self.unregister_cluster_node(node_id);

        let mut tracker = self.tracker.lock();
        for document_id in &affected {
            let was_primary = tracker
                .get_document_replicas(document_id)
                .and_then(|doc| doc.primary.as_ref())
                .map(|p| &p.node_id == node_id && p.status == ReplicaStatus::Failed)
                .unwrap_or(false);
            if was_primary {
                if let Some(promoted) = tracker.promote_best_replica(document_id) {
                    debug!("failover of {} to {}", document_id, promoted);
                }
            }
        }

        affected.len()
    }

    /// Spawn the background monitor: re-queues under-replicated documents
    /// and drains the task queue through the worker pool.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, AtomicOrdering::SeqCst) {
            return;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let interval = this.settings.read().check_interval_sec;
            loop {
                if !this.running.load(AtomicOrdering::SeqCst) {
                    break;
                }

                // One monitor iteration must never kill the loop
                let under_replicated = this.tracker.lock().under_replicated();
                for document_id in under_replicated {
                    this.queue_repair(&document_id, ReplicationPriority::High);
                }
                this.drain_queue();

                tokio::time::sleep(Duration::from_secs_f64(interval)).await;
            }
        });
        *self.monitor.lock() = Some(handle);
        info!("replication manager started");
    }

    pub async fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        info!("replication manager stopped");
    }

    /// Pop tasks while worker slots are available and execute them.
    pub fn drain_queue(self: &Arc<Self>) {
        loop {
            let permit = match Arc::clone(&self.worker_slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let Some(queued) = self.queue.lock().pop() else {
                return;
            };

            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                this.execute_task(queued.task).await;
            });
        }
    }

    /// Number of queued tasks not yet picked up by a worker.
    pub fn pending_tasks(&self) -> usize {
        self.queue.lock().len()
    }

    async fn execute_task(&self, mut task: ReplicationTask) {
        let (timeout_sec, retry_count, retry_delay) = {
            let s = self.settings.read();
            (s.replication_timeout_sec, s.retry_count, s.retry_delay_sec)
        };

        loop {
            task.attempts += 1;
            let result = self
                .do_replicate(&task.document_id, &task.source_node, &task.target_node, timeout_sec)
                .await;

            match result {
                Ok(true) => {
                    self.on_replicated(&task);
                    return;
                }
                Ok(false) | Err(_) => {
                    if task.attempts >= retry_count {
                        self.failed_replications.fetch_add(1, AtomicOrdering::SeqCst);
                        error!(
                            "replication of {} to {} failed after {} attempts",
                            task.document_id, task.target_node, task.attempts
                        );
                        return;
                    }
                    // Linear backoff
                    let delay = retry_delay * task.attempts as f64;
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
        }
    }

    async fn do_replicate(
        &self,
        document_id: &DocumentId,
        source: &NodeId,
        target: &NodeId,
        timeout_sec: f64,
    ) -> anyhow::Result<bool> {
        let replicate = self.replicate_fn.read().clone();
        match replicate {
            Some(f) => {
                let fut = f(document_id.clone(), source.clone(), target.clone());
                match tokio::time::timeout(Duration::from_secs_f64(timeout_sec), fut).await {
                    Ok(result) => result,
                    Err(_) => anyhow::bail!("replication timed out after {}s", timeout_sec),
                }
            }
            None => {
                warn!("no replicate function configured, treating copy as local no-op");
                Ok(true)
            }
        }
    }

    fn on_replicated(&self, task: &ReplicationTask) {
        {
            let mut tracker = self.tracker.lock();
            tracker.add_replica(&task.document_id, task.target_node.clone());
            tracker.update_replica_status(
                &task.document_id,
                &task.target_node,
                ReplicaStatus::Active,
                None,
            );

            if let Some(doc) = tracker.get_document_replicas(&task.document_id) {
                let replicas: Vec<NodeId> =
                    doc.replicas.iter().map(|r| r.node_id.clone()).collect();
                self.graph.write().update_document_location(
                    &task.document_id,
                    None,
                    Some(replicas),
                );
            }
        }

        self.total_replications.fetch_add(1, AtomicOrdering::SeqCst);
        self.events.publish(ClusterEvent::DocumentReplicated {
            document: task.document_id.clone(),
            target: task.target_node.clone(),
        });
        info!("replicated {} to {}", task.document_id, task.target_node);
    }

    pub fn document_locations(&self, document_id: &DocumentId) -> (Option<NodeId>, Vec<NodeId>) {
        let tracker = self.tracker.lock();
        match tracker.get_document_replicas(document_id) {
            Some(doc) => {
                let primary = doc.primary.as_ref().map(|p| p.node_id.clone());
                let replicas = doc
                    .replicas
                    .iter()
                    .filter(|r| r.is_healthy())
                    .map(|r| r.node_id.clone())
                    .collect();
                (primary, replicas)
            }
            None => (None, Vec::new()),
        }
    }

    pub fn statistics(&self) -> ReplicatorStatistics {
        let tracker = self.tracker.lock();
        ReplicatorStatistics {
            is_running: self.running.load(AtomicOrdering::SeqCst),
            pending_tasks: self.queue.lock().len(),
            total_replications: self.total_replications.load(AtomicOrdering::SeqCst),
            failed_replications: self.failed_replications.load(AtomicOrdering::SeqCst),
            cluster_nodes: self.cluster_nodes.read().len(),
            under_replicated: tracker.under_replicated().len(),
        }
    }

    /// Shared access to the tracker for orchestration layers.
    pub fn with_tracker<R>(&self, f: impl FnOnce(&mut ReplicaTracker) -> R) -> R {
        f(&mut self.tracker.lock())
    }

    /// Shared access to the similarity graph.
    pub fn with_graph<R>(&self, f: impl FnOnce(&mut SimilarityGraph) -> R) -> R {
        f(&mut self.graph.write())
    }
}
