//! Repair of under-replicated documents after node loss.
//!
//! Each affected document becomes a repair task: find a healthy source
//! replica, pick a target node outside the current replica set, and copy.
//! Tasks drain through a bounded worker pool in priority order with a
//! bounded retry budget.

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

use vantagedb_core::callbacks::{ReplicaInfoFn, ReplicateFn, TargetSelectorFn};
use vantagedb_core::types::{DocumentId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairTask {
    pub task_id: String,
    pub document_id: DocumentId,
    pub failed_node: NodeId,
    pub source_node: Option<NodeId>,
    pub target_node: Option<NodeId>,
    pub status: RepairStatus,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
}

struct QueuedRepair {
    priority: u8,
    seq: u64,
    task: RepairTask,
}

impl PartialEq for QueuedRepair {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRepair {}

impl Ord for QueuedRepair {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedRepair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct ReReplicationSettings {
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub retry_limit: u32,
    pub loop_interval_sec: f64,
}

impl Default for ReReplicationSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            batch_size: 20,
            retry_limit: 3,
            loop_interval_sec: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReReplicationStatistics {
    pub is_running: bool,
    pub pending_tasks: usize,
    pub active_tasks: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    pub success_rate: f64,
}

pub struct ReReplicationManager {
    settings: ReReplicationSettings,

    replicate_fn: RwLock<Option<ReplicateFn>>,
    replica_info_fn: RwLock<Option<ReplicaInfoFn>>,
    target_selector_fn: RwLock<Option<TargetSelectorFn>>,

    queue: Mutex<BinaryHeap<QueuedRepair>>,
    seq_counter: AtomicU64,
    worker_slots: Arc<Semaphore>,
    completed: Mutex<Vec<RepairTask>>,

    running: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,

    total_completed: AtomicU64,
    total_failed: AtomicU64,
}

impl ReReplicationManager {
    pub fn new(settings: ReReplicationSettings) -> Self {
        let worker_slots = Arc::new(Semaphore::new(settings.max_concurrent));
        Self {
            settings,
            replicate_fn: RwLock::new(None),
            replica_info_fn: RwLock::new(None),
            target_selector_fn: RwLock::new(None),
            queue: Mutex::new(BinaryHeap::new()),
            seq_counter: AtomicU64::new(0),
            worker_slots,
            completed: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            monitor: Mutex::new(None),
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }

    pub fn set_replicate_function(&self, f: ReplicateFn) {
        *self.replicate_fn.write() = Some(f);
    }

    pub fn set_replica_info_function(&self, f: ReplicaInfoFn) {
        *self.replica_info_fn.write() = Some(f);
    }

    pub fn set_target_selector(&self, f: TargetSelectorFn) {
        *self.target_selector_fn.write() = Some(f);
    }

    /// Queue one document for repair.
    pub fn queue_repair(
        &self,
        document_id: DocumentId,
        failed_node: NodeId,
        priority: u8,
    ) -> RepairTask {
        let task = RepairTask {
            task_id: format!("rerep_{}", Uuid::new_v4().simple()),
            document_id,
            failed_node,
            source_node: None,
            target_node: None,
            status: RepairStatus::Pending,
            priority,
            created_at: Utc::now(),
            completed_at: None,
            retry_count: 0,
            error: None,
        };

        let seq = self.seq_counter.fetch_add(1, AtomicOrdering::SeqCst);
        self.queue.lock().push(QueuedRepair {
            priority,
            seq,
            task: task.clone(),
        });
        debug!("queued repair for {}", task.document_id);
        task
    }

    /// Queue repairs for every document that lived on a failed node.
    pub fn queue_bulk_repair(
        &self,
        document_ids: Vec<DocumentId>,
        failed_node: &NodeId,
        priority: u8,
    ) -> Vec<RepairTask> {
        let tasks: Vec<RepairTask> = document_ids
            .into_iter()
            .map(|document_id| self.queue_repair(document_id, failed_node.clone(), priority))
            .collect();
        info!(
            "queued {} repairs for documents of {}",
            tasks.len(),
            failed_node
        );
        tasks
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.settings.max_concurrent - self.worker_slots.available_permits()
    }

    /// True once the queue is drained and no worker is busy.
    pub fn is_drained(&self) -> bool {
        self.pending_count() == 0 && self.active_count() == 0
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, AtomicOrdering::SeqCst) {
            return;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if !this.running.load(AtomicOrdering::SeqCst) {
                    break;
                }
                this.process_batch();
                tokio::time::sleep(Duration::from_secs_f64(this.settings.loop_interval_sec))
                    .await;
            }
        });
        *self.monitor.lock() = Some(handle);
        info!("re-replication processing started");
    }

    pub async fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        info!("re-replication processing stopped");
    }

    /// Move up to a batch of tasks from the queue into workers.
    pub fn process_batch(self: &Arc<Self>) {
        let mut dispatched = 0;
        while dispatched < self.settings.batch_size {
            let permit = match Arc::clone(&self.worker_slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let Some(queued) = self.queue.lock().pop() else {
                return;
            };

            dispatched += 1;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                this.execute_task(queued.task).await;
            });
        }
    }

    async fn execute_task(self: &Arc<Self>, mut task: RepairTask) {
        task.status = RepairStatus::InProgress;

        let outcome = self.try_repair(&mut task).await;

        match outcome {
            Ok(()) => {
                task.status = RepairStatus::Completed;
                task.completed_at = Some(Utc::now());
                self.total_completed.fetch_add(1, AtomicOrdering::SeqCst);
                info!(
                    "re-replicated {}: {:?} -> {:?}",
                    task.document_id, task.source_node, task.target_node
                );
                self.record_completed(task);
            }
            Err(e) => {
                task.error = Some(e.to_string());
                task.retry_count += 1;

                if task.retry_count < self.settings.retry_limit {
                    warn!(
                        "repair of {} failed (attempt {}/{}): {}",
                        task.document_id, task.retry_count, self.settings.retry_limit, e
                    );
                    task.status = RepairStatus::Pending;
                    let seq = self.seq_counter.fetch_add(1, AtomicOrdering::SeqCst);
                    self.queue.lock().push(QueuedRepair {
                        priority: task.priority,
                        seq,
                        task,
                    });
                } else {
                    error!("repair of {} permanently failed: {}", task.document_id, e);
                    task.status = RepairStatus::Failed;
                    task.completed_at = Some(Utc::now());
                    self.total_failed.fetch_add(1, AtomicOrdering::SeqCst);
                    self.record_completed(task);
                }
            }
        }
    }

    async fn try_repair(&self, task: &mut RepairTask) -> anyhow::Result<()> {
        let replica_info_fn = self
            .replica_info_fn
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no replica info probe configured"))?;
        let probe = replica_info_fn(task.document_id.clone())
            .await?
            .ok_or_else(|| anyhow::anyhow!("no replica info for {}", task.document_id))?;

        // Healthy source that is not the failed node
        let source = probe
            .healthy_nodes
            .iter()
            .find(|node| **node != task.failed_node)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no healthy source replica"))?;
        task.source_node = Some(source.clone());

        // Exclude every node already holding a copy
        let mut exclude: Vec<NodeId> = probe.replicas.keys().cloned().collect();
        if let Some(primary) = probe.primary {
            exclude.push(primary);
        }

        let target_selector = self
            .target_selector_fn
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no target selector configured"))?;
        let target = target_selector(task.document_id.clone(), exclude)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no available target node"))?;
        task.target_node = Some(target.clone());

        let replicate = self
            .replicate_fn
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no replicate function configured"))?;
        let copied = replicate(task.document_id.clone(), source, target).await?;
        if !copied {
            anyhow::bail!("replicate primitive reported failure");
        }
        Ok(())
    }

    fn record_completed(&self, task: RepairTask) {
        let mut completed = self.completed.lock();
        completed.push(task);
        // Bounded history
        if completed.len() > 1000 {
            let excess = completed.len() - 500;
            completed.drain(..excess);
        }
    }

    pub fn completed_tasks(&self, limit: usize) -> Vec<RepairTask> {
        let completed = self.completed.lock();
        completed.iter().rev().take(limit).cloned().collect()
    }

    pub fn statistics(&self) -> ReReplicationStatistics {
        let completed = self.total_completed.load(AtomicOrdering::SeqCst);
        let failed = self.total_failed.load(AtomicOrdering::SeqCst);
        ReReplicationStatistics {
            is_running: self.running.load(AtomicOrdering::SeqCst),
            pending_tasks: self.pending_count(),
            active_tasks: self.active_count(),
            total_completed: completed,
            total_failed: failed,
            success_rate: if completed + failed > 0 {
                completed as f64 / (completed + failed) as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::collections::HashMap;
    use vantagedb_core::callbacks::ReplicaProbe;

    fn probe_fn() -> ReplicaInfoFn {
        Arc::new(|_doc: DocumentId| {
            async move {
                let mut replicas = HashMap::new();
                replicas.insert(NodeId::from("n2"), "active".to_string());
                Ok(Some(ReplicaProbe {
                    primary: Some(NodeId::from("n1")),
                    replicas,
                    healthy_nodes: vec![NodeId::from("n2")],
                }))
            }
            .boxed()
        })
    }

    fn target_fn() -> TargetSelectorFn {
        Arc::new(|_doc, exclude: Vec<NodeId>| {
            async move {
                for candidate in ["n3", "n4"] {
                    let node = NodeId::from(candidate);
                    if !exclude.contains(&node) {
                        return Ok(Some(node));
                    }
                }
                Ok(None)
            }
            .boxed()
        })
    }

    fn manager() -> Arc<ReReplicationManager> {
        let m = Arc::new(ReReplicationManager::new(ReReplicationSettings {
            loop_interval_sec: 0.02,
            ..Default::default()
        }));
        m.set_replica_info_function(probe_fn());
        m.set_target_selector(target_fn());
        m.set_replicate_function(Arc::new(|_, _, _| async move { Ok(true) }.boxed()));
        m
    }

    #[tokio::test]
    async fn test_repair_completes_with_source_and_target() {
        let m = manager();
        m.queue_repair(DocumentId::from("d1"), NodeId::from("n1"), 2);
        m.process_batch();

        for _ in 0..100 {
            if m.is_drained() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = m.statistics();
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.total_failed, 0);

        let finished = &m.completed_tasks(1)[0];
        assert_eq!(finished.source_node, Some(NodeId::from("n2")));
        assert_eq!(finished.target_node, Some(NodeId::from("n3")));
    }

    #[tokio::test]
    async fn test_priority_order_respected() {
        let m = manager();
        m.queue_repair(DocumentId::from("low"), NodeId::from("n1"), 1);
        m.queue_repair(DocumentId::from("high"), NodeId::from("n1"), 3);

        let first = m.queue.lock().pop().unwrap();
        assert_eq!(first.task.document_id, DocumentId::from("high"));
    }

    #[tokio::test]
    async fn test_retries_until_limit_then_failed() {
        let m = Arc::new(ReReplicationManager::new(ReReplicationSettings {
            retry_limit: 2,
            loop_interval_sec: 0.01,
            ..Default::default()
        }));
        m.set_replica_info_function(probe_fn());
        m.set_target_selector(target_fn());
        m.set_replicate_function(Arc::new(|_, _, _| {
            async move { anyhow::bail!("target unreachable") }.boxed()
        }));

        m.queue_repair(DocumentId::from("d1"), NodeId::from("n1"), 2);
        m.start();

        for _ in 0..200 {
            if m.statistics().total_failed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        m.stop().await;

        let stats = m.statistics();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_completed, 0);
        let finished = &m.completed_tasks(1)[0];
        assert_eq!(finished.retry_count, 2);
    }

    #[tokio::test]
    async fn test_no_healthy_source_fails() {
        let m = Arc::new(ReReplicationManager::new(ReReplicationSettings {
            retry_limit: 1,
            ..Default::default()
        }));
        // Probe reports the failed node as the only "healthy" holder
        m.set_replica_info_function(Arc::new(|_doc| {
            async move {
                Ok(Some(ReplicaProbe {
                    primary: Some(NodeId::from("n1")),
                    replicas: HashMap::new(),
                    healthy_nodes: vec![NodeId::from("n1")],
                }))
            }
            .boxed()
        }));
        m.set_target_selector(target_fn());
        m.set_replicate_function(Arc::new(|_, _, _| async move { Ok(true) }.boxed()));

        m.queue_repair(DocumentId::from("d1"), NodeId::from("n1"), 2);
        m.process_batch();

        for _ in 0..100 {
            if m.statistics().total_failed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(m.statistics().total_failed, 1);
    }

    #[tokio::test]
    async fn test_bulk_queue_counts() {
        let m = manager();
        let docs: Vec<DocumentId> = (0..5).map(|i| DocumentId(format!("d{}", i))).collect();
        let tasks = m.queue_bulk_repair(docs, &NodeId::from("n1"), 2);
        assert_eq!(tasks.len(), 5);
        assert_eq!(m.pending_count(), 5);
    }
}
