//! Batched document migration between nodes.
//!
//! A migration task splits its document list into fixed-size batches,
//! pushes each batch through the transfer primitive with a hard timeout,
//! sleeps between batches for rate limiting, and retries a failed batch
//! before counting its documents as failed. Cancellation is honored at
//! batch boundaries. A task that moved at least some documents finishes
//! COMPLETED; the result carries exact migrated/failed counts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use vantagedb_core::callbacks::{TransferFn, TransferOutcome};
use vantagedb_core::types::{DocumentId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTask {
    pub task_id: String,
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub document_ids: Vec<DocumentId>,
    pub status: MigrationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Fraction of batches finished
    pub progress: f64,
    pub documents_migrated: usize,
    pub documents_failed: usize,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl MigrationTask {
    pub fn total_documents(&self) -> usize {
        self.document_ids.len()
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.status,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    pub task_id: String,
    pub success: bool,
    pub documents_migrated: usize,
    pub documents_failed: usize,
    pub failed_documents: Vec<DocumentId>,
}

#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub batch_size: usize,
    pub batch_delay_sec: f64,
    pub max_retries: u32,
    pub retry_delay_sec: f64,
    pub transfer_timeout_sec: f64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay_sec: 1.0,
            max_retries: 3,
            retry_delay_sec: 5.0,
            transfer_timeout_sec: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatistics {
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_documents_migrated: u64,
    pub total_documents_failed: u64,
}

pub struct MigrationHandler {
    settings: MigrationSettings,
    transfer_fn: Mutex<Option<TransferFn>>,
    tasks: Mutex<Vec<MigrationTask>>,
    cancelled: Mutex<HashSet<String>>,
    totals: Mutex<(u64, u64)>,
}

impl MigrationHandler {
    pub fn new(settings: MigrationSettings) -> Self {
        Self {
            settings,
            transfer_fn: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancelled: Mutex::new(HashSet::new()),
            totals: Mutex::new((0, 0)),
        }
    }

    pub fn set_transfer_function(&self, f: TransferFn) {
        *self.transfer_fn.lock() = Some(f);
    }

    pub fn create_task(
        &self,
        source_node: NodeId,
        target_node: NodeId,
        document_ids: Vec<DocumentId>,
    ) -> MigrationTask {
        let task = MigrationTask {
            task_id: format!("mig_{}", &Uuid::new_v4().simple().to_string()[..12]),
            source_node,
            target_node,
            document_ids,
            status: MigrationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            documents_migrated: 0,
            documents_failed: 0,
            retry_count: 0,
            error_message: None,
        };

        info!(
            "created migration task {}: {} docs from {} to {}",
            task.task_id,
            task.total_documents(),
            task.source_node,
            task.target_node
        );
        self.tasks.lock().push(task.clone());
        task
    }

    /// Execute a task to completion, batching with rate limiting.
    pub async fn execute_task(&self, task_id: &str) -> anyhow::Result<MigrationResult> {
        let (source, target, document_ids) = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .iter_mut()
                .find(|t| t.task_id == task_id)
                .ok_or_else(|| anyhow::anyhow!("unknown migration task: {}", task_id))?;
            if task.is_complete() {
                anyhow::bail!("migration task already complete: {}", task_id);
            }
            task.status = MigrationStatus::InProgress;
            task.started_at = Some(Utc::now());
            (
                task.source_node.clone(),
                task.target_node.clone(),
                task.document_ids.clone(),
            )
        };

        info!("starting migration task {}", task_id);

        let batches: Vec<&[DocumentId]> = document_ids.chunks(self.settings.batch_size).collect();
        let total_batches = batches.len();

        let mut migrated = 0usize;
        let mut failed = 0usize;
        let mut failed_docs: Vec<DocumentId> = Vec::new();
        let mut was_cancelled = false;

        for (batch_idx, batch) in batches.iter().enumerate() {
            // Cancellation is only honored between batches
            if self.cancelled.lock().contains(task_id) {
                was_cancelled = true;
                break;
            }

            match self.transfer_batch(&source, &target, batch).await {
                Ok(outcome) => {
                    migrated += outcome.migrated.len();
                    failed += outcome.failed.len();
                    failed_docs.extend(outcome.failed);
                }
                Err(e) => {
                    warn!("batch {} of task {} failed: {}", batch_idx, task_id, e);
                    let mut recovered = false;

                    let mut attempts = 0;
                    while attempts < self.settings.max_retries {
                        attempts += 1;
                        self.bump_retry(task_id);
                        tokio::time::sleep(Duration::from_secs_f64(
                            self.settings.retry_delay_sec,
                        ))
                        .await;

                        match self.transfer_batch(&source, &target, batch).await {
                            Ok(outcome) => {
                                migrated += outcome.migrated.len();
                                failed += outcome.failed.len();
                                failed_docs.extend(outcome.failed);
                                recovered = true;
                                break;
                            }
                            Err(retry_err) => {
                                warn!(
                                    "retry {} of batch {} failed: {}",
                                    attempts, batch_idx, retry_err
                                );
                            }
                        }
                    }

                    if !recovered {
                        failed += batch.len();
                        failed_docs.extend(batch.iter().cloned());
                    }
                }
            }

            self.update_progress(task_id, (batch_idx + 1) as f64 / total_batches as f64, migrated, failed);

            // Rate limiting between batches
            if batch_idx < total_batches - 1 {
                tokio::time::sleep(Duration::from_secs_f64(self.settings.batch_delay_sec)).await;
            }
        }

        let status = if was_cancelled {
            MigrationStatus::Cancelled
        } else if failed == 0 || migrated > 0 {
            // Partial success still counts as completed
            MigrationStatus::Completed
        } else {
            MigrationStatus::Failed
        };

        {
            let mut tasks = self.tasks.lock();
            if let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) {
                task.status = status;
                task.completed_at = Some(Utc::now());
                task.progress = 1.0;
                task.documents_migrated = migrated;
                task.documents_failed = failed;
            }
        }
        {
            let mut totals = self.totals.lock();
            totals.0 += migrated as u64;
            totals.1 += failed as u64;
        }

        info!(
            "migration task {} finished: {} migrated, {} failed, status {:?}",
            task_id, migrated, failed, status
        );

        Ok(MigrationResult {
            task_id: task_id.to_string(),
            success: failed == 0 && !was_cancelled,
            documents_migrated: migrated,
            documents_failed: failed,
            failed_documents: failed_docs,
        })
    }

    async fn transfer_batch(
        &self,
        source: &NodeId,
        target: &NodeId,
        batch: &[DocumentId],
    ) -> anyhow::Result<TransferOutcome> {
        let transfer = self.transfer_fn.lock().clone();
        let Some(transfer) = transfer else {
            error!("no transfer function configured");
            anyhow::bail!("no transfer function configured");
        };

        let fut = transfer(source.clone(), target.clone(), batch.to_vec());
        match tokio::time::timeout(
            Duration::from_secs_f64(self.settings.transfer_timeout_sec),
            fut,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "transfer timed out after {}s",
                self.settings.transfer_timeout_sec
            ),
        }
    }

    fn update_progress(&self, task_id: &str, progress: f64, migrated: usize, failed: usize) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) {
            task.progress = progress;
            task.documents_migrated = migrated;
            task.documents_failed = failed;
        }
    }

    fn bump_retry(&self, task_id: &str) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) {
            task.retry_count += 1;
        }
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        let tasks = self.tasks.lock();
        let Some(task) = tasks.iter().find(|t| t.task_id == task_id) else {
            return false;
        };
        if task.is_complete() {
            return false;
        }
        drop(tasks);

        self.cancelled.lock().insert(task_id.to_string());
        info!("cancelled migration task {}", task_id);
        true
    }

    pub fn get_task(&self, task_id: &str) -> Option<MigrationTask> {
        self.tasks.lock().iter().find(|t| t.task_id == task_id).cloned()
    }

    pub fn active_tasks(&self) -> Vec<MigrationTask> {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.is_complete())
            .cloned()
            .collect()
    }

    pub fn task_history(&self, limit: usize) -> Vec<MigrationTask> {
        let mut completed: Vec<MigrationTask> = self
            .tasks
            .lock()
            .iter()
            .filter(|t| t.is_complete())
            .cloned()
            .collect();
        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        completed.truncate(limit);
        completed
    }

    /// Drop completed tasks older than the cutoff. Returns removed count.
    pub fn cleanup_old_tasks(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| {
            !(t.is_complete() && t.completed_at.map(|at| at < cutoff).unwrap_or(false))
        });
        before - tasks.len()
    }

    pub fn statistics(&self) -> MigrationStatistics {
        let tasks = self.tasks.lock();
        let totals = self.totals.lock();
        MigrationStatistics {
            total_tasks: tasks.len(),
            active_tasks: tasks.iter().filter(|t| !t.is_complete()).count(),
            completed_tasks: tasks
                .iter()
                .filter(|t| t.status == MigrationStatus::Completed)
                .count(),
            failed_tasks: tasks
                .iter()
                .filter(|t| t.status == MigrationStatus::Failed)
                .count(),
            total_documents_migrated: totals.0,
            total_documents_failed: totals.1,
        }
    }
}

/// Transfer function that succeeds for every document; test scaffolding.
pub fn noop_transfer() -> TransferFn {
    use futures::FutureExt;
    Arc::new(|_source, _target, docs: Vec<DocumentId>| {
        async move {
            Ok(TransferOutcome {
                migrated: docs,
                failed: Vec::new(),
            })
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn docs(n: usize) -> Vec<DocumentId> {
        (0..n).map(|i| DocumentId(format!("doc_{}", i))).collect()
    }

    fn handler(settings: MigrationSettings) -> MigrationHandler {
        let h = MigrationHandler::new(settings);
        h.set_transfer_function(noop_transfer());
        h
    }

    #[tokio::test]
    async fn test_batching_with_rate_limiting() {
        let h = handler(MigrationSettings {
            batch_size: 50,
            batch_delay_sec: 0.2,
            ..Default::default()
        });

        let task = h.create_task(NodeId::from("n4"), NodeId::from("n1"), docs(75));
        let start = Instant::now();
        let result = h.execute_task(&task.task_id).await.unwrap();
        let elapsed = start.elapsed();

        assert!(result.success);
        assert_eq!(result.documents_migrated, 75);
        // Two batches means at least one inter-batch delay
        assert!(elapsed >= Duration::from_millis(200));

        let finished = h.get_task(&task.task_id).unwrap();
        assert_eq!(finished.status, MigrationStatus::Completed);
        assert_eq!(finished.progress, 1.0);
    }

    #[tokio::test]
    async fn test_batch_retry_then_counted_failed() {
        let h = MigrationHandler::new(MigrationSettings {
            batch_size: 10,
            batch_delay_sec: 0.0,
            max_retries: 2,
            retry_delay_sec: 0.0,
            ..Default::default()
        });

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);
        h.set_transfer_function(Arc::new(move |_, _, _| {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            async move { anyhow::bail!("peer unreachable") }.boxed()
        }));

        let task = h.create_task(NodeId::from("a"), NodeId::from("b"), docs(10));
        let result = h.execute_task(&task.task_id).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.documents_failed, 10);
        assert_eq!(result.failed_documents.len(), 10);
        // Initial attempt plus two retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let finished = h.get_task(&task.task_id).unwrap();
        assert_eq!(finished.status, MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn test_partial_success_is_completed() {
        let h = MigrationHandler::new(MigrationSettings {
            batch_size: 5,
            batch_delay_sec: 0.0,
            max_retries: 0,
            retry_delay_sec: 0.0,
            ..Default::default()
        });

        // First batch succeeds, second fails
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        h.set_transfer_function(Arc::new(move |_, _, batch: Vec<DocumentId>| {
            let call = calls_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Ok(TransferOutcome {
                        migrated: batch,
                        failed: Vec::new(),
                    })
                } else {
                    anyhow::bail!("target went away")
                }
            }
            .boxed()
        }));

        let task = h.create_task(NodeId::from("a"), NodeId::from("b"), docs(10));
        let result = h.execute_task(&task.task_id).await.unwrap();

        assert_eq!(result.documents_migrated, 5);
        assert_eq!(result.documents_failed, 5);
        let finished = h.get_task(&task.task_id).unwrap();
        assert_eq!(finished.status, MigrationStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancellation_between_batches() {
        let h = handler(MigrationSettings {
            batch_size: 5,
            batch_delay_sec: 0.1,
            ..Default::default()
        });

        let task = h.create_task(NodeId::from("a"), NodeId::from("b"), docs(50));
        h.cancel_task(&task.task_id);

        let result = h.execute_task(&task.task_id).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.documents_migrated, 0);

        let finished = h.get_task(&task.task_id).unwrap();
        assert_eq!(finished.status, MigrationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_transfer_timeout_enforced() {
        let h = MigrationHandler::new(MigrationSettings {
            batch_size: 10,
            batch_delay_sec: 0.0,
            max_retries: 0,
            retry_delay_sec: 0.0,
            transfer_timeout_sec: 0.05,
        });

        h.set_transfer_function(Arc::new(|_, _, _| {
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(TransferOutcome::default())
            }
            .boxed()
        }));

        let task = h.create_task(NodeId::from("a"), NodeId::from("b"), docs(10));
        let result = h.execute_task(&task.task_id).await.unwrap();
        assert_eq!(result.documents_failed, 10);
    }

    #[tokio::test]
    async fn test_cleanup_drops_only_old_completed() {
        let h = handler(MigrationSettings {
            batch_delay_sec: 0.0,
            ..Default::default()
        });
        let task = h.create_task(NodeId::from("a"), NodeId::from("b"), docs(5));
        h.execute_task(&task.task_id).await.unwrap();

        // Fresh tasks stay
        assert_eq!(h.cleanup_old_tasks(chrono::Duration::hours(1)), 0);
        // Everything completed is older than a zero-length window
        assert_eq!(h.cleanup_old_tasks(chrono::Duration::zero()), 1);
    }
}
