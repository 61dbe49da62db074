//! Failure recovery orchestration.
//!
//! On a FAILED transition the service walks a fixed workflow: assess which
//! documents lived on the dead node, promote replicas where it was
//! primary, queue re-replication for everything now under-replicated, and
//! wait for the repair queue to drain before recording the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use vantagedb_core::callbacks::{ReplicaInfoFn, ReplicateFn, TargetSelectorFn};
use vantagedb_core::types::{DocumentId, NodeId};

use crate::failure_detector::{
    FailureDetector, FailureDetectorSettings, FailureEvent, NodeHealth,
};
use crate::re_replication::{ReReplicationManager, ReReplicationSettings};

/// Looks up the documents stored on a node.
pub type DocumentsOnNodeFn =
    Arc<dyn Fn(NodeId) -> BoxFuture<'static, anyhow::Result<Vec<DocumentId>>> + Send + Sync>;

/// Promotes a replica of a document to primary.
pub type PromoteReplicaFn =
    Arc<dyn Fn(DocumentId, NodeId) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryPhase {
    Detection,
    Assessment,
    Promotion,
    ReReplication,
    Verification,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub detector: FailureDetectorSettings,
    pub re_replication: ReReplicationSettings,
    pub assessment_delay_sec: f64,
    pub verification_timeout_sec: f64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            detector: FailureDetectorSettings::default(),
            re_replication: ReReplicationSettings::default(),
            assessment_delay_sec: 2.0,
            verification_timeout_sec: 60.0,
        }
    }
}

/// One recovery run for one failed node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryTask {
    pub task_id: String,
    pub failed_node: NodeId,
    pub phase: RecoveryPhase,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub affected_documents: Vec<DocumentId>,
    /// document -> node promoted to primary
    pub promoted_primaries: HashMap<DocumentId, NodeId>,
    pub documents_recovered: u64,
    pub documents_failed: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub is_running: bool,
    pub active_recoveries: usize,
    pub total_recoveries: usize,
    pub total_documents_recovered: u64,
    pub total_documents_failed: u64,
}

pub struct RecoveryService {
    settings: RecoverySettings,
    pub failure_detector: Arc<FailureDetector>,
    pub re_replication: Arc<ReReplicationManager>,

    documents_on_node_fn: RwLock<Option<DocumentsOnNodeFn>>,
    replica_info_fn: RwLock<Option<ReplicaInfoFn>>,
    promote_fn: RwLock<Option<PromoteReplicaFn>>,

    active: Mutex<HashMap<String, RecoveryTask>>,
    history: Mutex<Vec<RecoveryTask>>,
    task_counter: AtomicU64,
    running: AtomicBool,
}

impl RecoveryService {
    pub fn new(settings: RecoverySettings) -> Arc<Self> {
        let failure_detector = Arc::new(FailureDetector::new(settings.detector.clone()));
        let re_replication = Arc::new(ReReplicationManager::new(settings.re_replication.clone()));

        let service = Arc::new(Self {
            settings,
            failure_detector,
            re_replication,
            documents_on_node_fn: RwLock::new(None),
            replica_info_fn: RwLock::new(None),
            promote_fn: RwLock::new(None),
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            task_counter: AtomicU64::new(0),
            running: AtomicBool::new(false),
        });

        // Failure events flow straight into the recovery workflow
        let weak = Arc::downgrade(&service);
        service.failure_detector.add_failure_callback(Arc::new(move |event| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(service) = weak.upgrade() {
                    service.handle_failure(event).await;
                }
            })
        }));

        service
    }

    pub fn set_documents_on_node_function(&self, f: DocumentsOnNodeFn) {
        *self.documents_on_node_fn.write() = Some(f);
    }

    pub fn set_replica_info_function(&self, f: ReplicaInfoFn) {
        *self.replica_info_fn.write() = Some(f.clone());
        self.re_replication.set_replica_info_function(f);
    }

    pub fn set_promote_function(&self, f: PromoteReplicaFn) {
        *self.promote_fn.write() = Some(f);
    }

    pub fn set_replicate_function(&self, f: ReplicateFn) {
        self.re_replication.set_replicate_function(f);
    }

    pub fn set_target_selector(&self, f: TargetSelectorFn) {
        self.re_replication.set_target_selector(f);
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        self.failure_detector.start();
        self.re_replication.start();
        info!("recovery service started");
    }

    pub async fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        self.failure_detector.stop().await;
        self.re_replication.stop().await;
        info!("recovery service stopped");
    }

    pub fn register_node(&self, node_id: NodeId) {
        self.failure_detector.register_node(node_id);
    }

    pub fn unregister_node(&self, node_id: &NodeId) {
        self.failure_detector.unregister_node(node_id);
    }

    pub fn record_heartbeat(&self, node_id: &NodeId, latency_ms: f64) {
        self.failure_detector.record_heartbeat(node_id, latency_ms, None);
    }

    async fn handle_failure(self: &Arc<Self>, event: FailureEvent) {
        error!("handling failure of node {}", event.node_id);

        let task_id = format!(
            "recovery_{}",
            self.task_counter.fetch_add(1, AtomicOrdering::SeqCst) + 1
        );
        let mut task = RecoveryTask {
            task_id: task_id.clone(),
            failed_node: event.node_id.clone(),
            phase: RecoveryPhase::Detection,
            started_at: Utc::now(),
            completed_at: None,
            affected_documents: Vec::new(),
            promoted_primaries: HashMap::new(),
            documents_recovered: 0,
            documents_failed: 0,
            error: None,
        };
        self.active.lock().insert(task_id.clone(), task.clone());

        if let Err(e) = self.execute_recovery(&mut task).await {
            error!("recovery of {} failed: {}", event.node_id, e);
            task.phase = RecoveryPhase::Failed;
            task.error = Some(e.to_string());
        }

        task.completed_at = Some(Utc::now());
        self.active.lock().remove(&task_id);
        self.history.lock().push(task);
    }

    async fn execute_recovery(self: &Arc<Self>, task: &mut RecoveryTask) -> anyhow::Result<()> {
        // Assessment: wait briefly for the cluster to settle, then list
        // everything that lived on the dead node.
        task.phase = RecoveryPhase::Assessment;
        tokio::time::sleep(Duration::from_secs_f64(self.settings.assessment_delay_sec)).await;

        task.affected_documents = self.assess_impact(&task.failed_node).await?;
        info!(
            "recovery assessment: {} documents affected by loss of {}",
            task.affected_documents.len(),
            task.failed_node
        );

        if task.affected_documents.is_empty() {
            task.phase = RecoveryPhase::Completed;
            return Ok(());
        }

        // Promotion: a new primary for every document the dead node led.
        task.phase = RecoveryPhase::Promotion;
        self.promote_replicas(task).await;

        // Re-replication: repair everything at HIGH priority.
        task.phase = RecoveryPhase::ReReplication;
        self.re_replication.queue_bulk_repair(
            task.affected_documents.clone(),
            &task.failed_node,
            3,
        );
        self.re_replication.process_batch();

        // Verification: wait for the repair queue to drain.
        task.phase = RecoveryPhase::Verification;
        self.verify_recovery(task).await;

        task.phase = RecoveryPhase::Completed;
        info!(
            "recovery of {} completed: {} recovered, {} failed",
            task.failed_node, task.documents_recovered, task.documents_failed
        );
        Ok(())
    }

    async fn assess_impact(&self, node_id: &NodeId) -> anyhow::Result<Vec<DocumentId>> {
        let f = self
            .documents_on_node_fn
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no document lookup configured"))?;
        f(node_id.clone()).await
    }

    async fn promote_replicas(&self, task: &mut RecoveryTask) {
        let replica_info_fn = self.replica_info_fn.read().clone();
        let promote_fn = self.promote_fn.read().clone();
        let (Some(replica_info_fn), Some(promote_fn)) = (replica_info_fn, promote_fn) else {
            warn!("promotion skipped: probe or promote function missing");
            return;
        };

        for document_id in &task.affected_documents {
            let probe = match replica_info_fn(document_id.clone()).await {
                Ok(Some(probe)) => probe,
                Ok(None) => continue,
                Err(e) => {
                    warn!("replica probe for {} failed: {}", document_id, e);
                    continue;
                }
            };

            // Only documents the failed node led need a new primary
            if probe.primary.as_ref() != Some(&task.failed_node) {
                continue;
            }

            // First healthy replica by node id
            let mut healthy: Vec<NodeId> = probe
                .replicas
                .iter()
                .filter(|(node, status)| {
                    *status == "active" && **node != task.failed_node
                })
                .map(|(node, _)| node.clone())
                .collect();
            healthy.sort();

            let Some(new_primary) = healthy.into_iter().next() else {
                warn!("no healthy replica of {} to promote", document_id);
                continue;
            };

            match promote_fn(document_id.clone(), new_primary.clone()).await {
                Ok(true) => {
                    info!("promoted {} to primary for {}", new_primary, document_id);
                    task.promoted_primaries
                        .insert(document_id.clone(), new_primary);
                }
                Ok(false) => warn!("promotion refused for {}", document_id),
                Err(e) => error!("promotion of {} failed: {}", document_id, e),
            }
        }
    }

    async fn verify_recovery(&self, task: &mut RecoveryTask) {
        let timeout = Duration::from_secs_f64(self.settings.verification_timeout_sec);
        let started = tokio::time::Instant::now();

        while started.elapsed() < timeout {
            self.re_replication.process_batch();
            if self.re_replication.is_drained() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let stats = self.re_replication.statistics();
        task.documents_recovered = stats.total_completed;
        task.documents_failed = stats.total_failed;
    }

    /// Kick off recovery for a node outside the heartbeat path.
    pub async fn trigger_manual_recovery(self: &Arc<Self>, node_id: NodeId) -> Option<RecoveryTask> {
        let event = FailureEvent {
            node_id: node_id.clone(),
            detected_at: Utc::now(),
            last_healthy: None,
            failure_type: "manual".to_string(),
            details: String::new(),
        };
        self.handle_failure(event).await;

        self.history
            .lock()
            .iter()
            .rev()
            .find(|t| t.failed_node == node_id)
            .cloned()
    }

    pub fn node_health(&self, node_id: &NodeId) -> Option<NodeHealth> {
        self.failure_detector.node_health(node_id)
    }

    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        self.failure_detector.healthy_nodes()
    }

    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.failure_detector.failed_nodes()
    }

    pub fn active_recoveries(&self) -> Vec<RecoveryTask> {
        self.active.lock().values().cloned().collect()
    }

    pub fn recovery_history(&self, limit: usize) -> Vec<RecoveryTask> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        let history = self.history.lock();
        RecoveryStatistics {
            is_running: self.running.load(AtomicOrdering::SeqCst),
            active_recoveries: self.active.lock().len(),
            total_recoveries: history.len(),
            total_documents_recovered: history.iter().map(|t| t.documents_recovered).sum(),
            total_documents_failed: history.iter().map(|t| t.documents_failed).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vantagedb_core::callbacks::ReplicaProbe;

    fn service() -> Arc<RecoveryService> {
        let service = RecoveryService::new(RecoverySettings {
            assessment_delay_sec: 0.0,
            verification_timeout_sec: 2.0,
            re_replication: ReReplicationSettings {
                loop_interval_sec: 0.02,
                ..Default::default()
            },
            ..Default::default()
        });

        service.set_documents_on_node_function(Arc::new(|_node| {
            async move { Ok(vec![DocumentId::from("d1")]) }.boxed()
        }));
        service.set_replica_info_function(Arc::new(|_doc| {
            async move {
                let mut replicas = StdHashMap::new();
                replicas.insert(NodeId::from("n3"), "active".to_string());
                replicas.insert(NodeId::from("n2"), "active".to_string());
                Ok(Some(ReplicaProbe {
                    primary: Some(NodeId::from("n1")),
                    replicas,
                    healthy_nodes: vec![NodeId::from("n2"), NodeId::from("n3")],
                }))
            }
            .boxed()
        }));
        service.set_target_selector(Arc::new(|_doc, exclude: Vec<NodeId>| {
            async move {
                for candidate in ["n4", "n5"] {
                    let node = NodeId::from(candidate);
                    if !exclude.contains(&node) {
                        return Ok(Some(node));
                    }
                }
                Ok(None)
            }
            .boxed()
        }));
        service.set_replicate_function(Arc::new(|_, _, _| async move { Ok(true) }.boxed()));
        service
    }

    #[tokio::test]
    async fn test_manual_recovery_walks_all_phases() {
        let s = service();
        let promoted = Arc::new(AtomicUsize::new(0));
        let promoted_clone = Arc::clone(&promoted);
        s.set_promote_function(Arc::new(move |_doc, node| {
            let promoted = Arc::clone(&promoted_clone);
            async move {
                // Lowest healthy replica id wins
                assert_eq!(node, NodeId::from("n2"));
                promoted.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            .boxed()
        }));

        let task = s
            .trigger_manual_recovery(NodeId::from("n1"))
            .await
            .expect("recovery task recorded");

        assert_eq!(task.phase, RecoveryPhase::Completed);
        assert_eq!(task.affected_documents, vec![DocumentId::from("d1")]);
        assert_eq!(
            task.promoted_primaries.get(&DocumentId::from("d1")),
            Some(&NodeId::from("n2"))
        );
        assert_eq!(promoted.load(Ordering::SeqCst), 1);
        assert_eq!(task.documents_recovered, 1);
        assert_eq!(task.documents_failed, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_loss_triggers_recovery() {
        let s = RecoveryService::new(RecoverySettings {
            assessment_delay_sec: 0.0,
            verification_timeout_sec: 1.0,
            detector: FailureDetectorSettings {
                heartbeat_interval_sec: 0.02,
                failure_timeout_sec: 0.05,
                suspect_threshold: 2,
                failure_threshold: 3,
            },
            re_replication: ReReplicationSettings {
                loop_interval_sec: 0.02,
                ..Default::default()
            },
        });
        s.set_documents_on_node_function(Arc::new(|_node| async move { Ok(vec![]) }.boxed()));

        s.start();
        s.register_node(NodeId::from("n1"));
        s.record_heartbeat(&NodeId::from("n1"), 1.0);

        // Stop beating; the monitor should cross the failure threshold
        for _ in 0..100 {
            if !s.recovery_history(1).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        s.stop().await;

        let history = s.recovery_history(1);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].failed_node, NodeId::from("n1"));
        assert_eq!(history[0].phase, RecoveryPhase::Completed);
    }

    #[tokio::test]
    async fn test_assessment_without_documents_completes_immediately() {
        let s = service();
        s.set_documents_on_node_function(Arc::new(|_node| async move { Ok(vec![]) }.boxed()));

        let task = s.trigger_manual_recovery(NodeId::from("n9")).await.unwrap();
        assert_eq!(task.phase, RecoveryPhase::Completed);
        assert!(task.promoted_primaries.is_empty());
    }
}
