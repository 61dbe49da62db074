//! Active rebalancer.
//!
//! Periodically inspects cluster load and, outside the cooldown window,
//! turns a rebalance plan into rate-limited migrations. Documents to move
//! are chosen by the externally supplied selector so the placement policy
//! (least recently accessed, semantic outliers) stays with the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use vantagedb_core::callbacks::{DocumentSelectorFn, TransferFn};
use vantagedb_core::events::{ClusterEvent, EventBus};
use vantagedb_core::types::NodeId;

use crate::load::{ClusterLoadSummary, LoadCalculator, LoadMetrics, RebalanceDecision};
use crate::migration::{MigrationHandler, MigrationResult, MigrationSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceStatus {
    Idle,
    Analyzing,
    Planning,
    Executing,
    Paused,
}

#[derive(Debug, Clone)]
pub struct RebalancerSettings {
    pub imbalance_threshold: f64,
    pub critical_threshold: f64,
    pub min_transfer_size: usize,
    pub check_interval_sec: f64,
    pub cooldown_after_rebalance_sec: f64,
    pub max_documents_per_rebalance: usize,
    pub migration: MigrationSettings,
}

impl Default for RebalancerSettings {
    fn default() -> Self {
        Self {
            imbalance_threshold: 0.2,
            critical_threshold: 0.9,
            min_transfer_size: 10,
            check_interval_sec: 60.0,
            cooldown_after_rebalance_sec: 300.0,
            max_documents_per_rebalance: 1000,
            migration: MigrationSettings::default(),
        }
    }
}

/// Record of one rebalance run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceOperation {
    pub operation_id: String,
    pub status: RebalanceStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub decisions: Vec<RebalanceDecision>,
    pub migration_tasks: Vec<String>,
    pub documents_moved: usize,
    pub documents_failed: usize,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancerStatistics {
    pub status: RebalanceStatus,
    pub is_running: bool,
    pub is_in_cooldown: bool,
    pub total_operations: usize,
    pub total_documents_moved: usize,
    pub total_documents_failed: usize,
    pub last_rebalance: Option<DateTime<Utc>>,
}

pub struct ActiveRebalancer {
    settings: RebalancerSettings,
    pub load_calculator: Mutex<LoadCalculator>,
    pub migration_handler: Arc<MigrationHandler>,
    document_selector: RwLock<Option<DocumentSelectorFn>>,

    status: RwLock<RebalanceStatus>,
    history: Mutex<Vec<RebalanceOperation>>,
    // Cooldown uses the monotonic clock; wall-clock time only feeds reports
    last_rebalance_mono: Mutex<Option<Instant>>,
    last_rebalance_wall: Mutex<Option<DateTime<Utc>>>,
    operation_counter: AtomicU64,

    running: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
}

impl ActiveRebalancer {
    pub fn new(settings: RebalancerSettings, events: EventBus) -> Self {
        let load_calculator = LoadCalculator::new(
            settings.imbalance_threshold,
            settings.critical_threshold,
            settings.min_transfer_size,
        );
        let migration_handler = Arc::new(MigrationHandler::new(settings.migration.clone()));

        Self {
            settings,
            load_calculator: Mutex::new(load_calculator),
            migration_handler,
            document_selector: RwLock::new(None),
            status: RwLock::new(RebalanceStatus::Idle),
            history: Mutex::new(Vec::new()),
            last_rebalance_mono: Mutex::new(None),
            last_rebalance_wall: Mutex::new(None),
            operation_counter: AtomicU64::new(0),
            running: AtomicBool::new(false),
            monitor: Mutex::new(None),
            events,
        }
    }

    pub fn status(&self) -> RebalanceStatus {
        *self.status.read()
    }

    pub fn is_in_cooldown(&self) -> bool {
        match *self.last_rebalance_mono.lock() {
            Some(at) => {
                at.elapsed() < Duration::from_secs_f64(self.settings.cooldown_after_rebalance_sec)
            }
            None => false,
        }
    }

    pub fn set_document_selector(&self, f: DocumentSelectorFn) {
        *self.document_selector.write() = Some(f);
    }

    pub fn set_transfer_function(&self, f: TransferFn) {
        self.migration_handler.set_transfer_function(f);
    }

    pub fn register_node(&self, node_id: NodeId, capacity: usize, document_count: usize) {
        self.load_calculator
            .lock()
            .register_node(node_id, capacity, document_count);
    }

    pub fn unregister_node(&self, node_id: &NodeId) {
        self.load_calculator.lock().remove_node(node_id);
    }

    pub fn update_node_metrics(&self, metrics: LoadMetrics) {
        self.load_calculator.lock().update_node_metrics(metrics);
    }

    pub fn set_document_count(&self, node_id: &NodeId, count: usize) {
        self.load_calculator.lock().set_document_count(node_id, count);
    }

    pub fn set_node_health(&self, node_id: &NodeId, is_healthy: bool) {
        self.load_calculator.lock().set_health(node_id, is_healthy);
    }

    pub fn cluster_summary(&self) -> ClusterLoadSummary {
        self.load_calculator.lock().cluster_summary()
    }

    pub fn needs_rebalance(&self) -> (bool, String) {
        self.load_calculator.lock().needs_rebalancing()
    }

    /// Start the periodic check loop.
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
                // One failed iteration must not stop monitoring
                if let Err(e) = this.check_and_rebalance().await {
                    error!("rebalance check failed: {}", e);
                }
                tokio::time::sleep(Duration::from_secs_f64(this.settings.check_interval_sec))
                    .await;
            }
        });
        *self.monitor.lock() = Some(handle);
        info!("rebalancer monitoring started");
    }

    pub async fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        info!("rebalancer monitoring stopped");
    }

    async fn check_and_rebalance(&self) -> anyhow::Result<()> {
        if self.status() != RebalanceStatus::Idle || self.is_in_cooldown() {
            return Ok(());
        }

        let (needed, reason) = self.needs_rebalance();
        if needed {
            info!("rebalance triggered: {}", reason);
            self.execute_rebalance().await?;
        }
        Ok(())
    }

    /// Run one full rebalance: analyze, plan, execute, record.
    pub async fn execute_rebalance(&self) -> anyhow::Result<RebalanceOperation> {
        let operation_id = format!(
            "rebal_{}",
            self.operation_counter.fetch_add(1, AtomicOrdering::SeqCst) + 1
        );

        let mut operation = RebalanceOperation {
            operation_id: operation_id.clone(),
            status: RebalanceStatus::Analyzing,
            started_at: Utc::now(),
            completed_at: None,
            decisions: Vec::new(),
            migration_tasks: Vec::new(),
            documents_moved: 0,
            documents_failed: 0,
            error_message: None,
        };

        *self.status.write() = RebalanceStatus::Analyzing;
        self.events.publish(ClusterEvent::RebalanceStarted {
            operation_id: operation_id.clone(),
        });

        let result: anyhow::Result<()> = async {
            *self.status.write() = RebalanceStatus::Planning;
            let mut decisions = self.load_calculator.lock().generate_plan();

            // Cap the total volume of one run
            let mut budget = self.settings.max_documents_per_rebalance;
            decisions.retain_mut(|d| {
                if budget == 0 {
                    return false;
                }
                d.documents_to_move = d.documents_to_move.min(budget);
                budget -= d.documents_to_move;
                d.documents_to_move >= self.settings.min_transfer_size
            });
            operation.decisions = decisions.clone();

            if decisions.is_empty() {
                info!("no rebalance work after planning");
                return Ok(());
            }

            let impact = self.load_calculator.lock().estimate_impact(&decisions);
            info!(
                "rebalance plan: {} migrations, {} documents, projected std {:.3} -> {:.3}",
                impact.migrations,
                impact.total_documents_moved,
                impact.current_load_std,
                impact.projected_load_std
            );

            *self.status.write() = RebalanceStatus::Executing;
            for decision in &decisions {
                if !self.running.load(AtomicOrdering::SeqCst)
                    && self.monitor.lock().is_some()
                {
                    break;
                }

                match self.execute_decision(decision).await {
                    Ok(Some(result)) => {
                        operation.migration_tasks.push(result.task_id.clone());
                        operation.documents_moved += result.documents_migrated;
                        operation.documents_failed += result.documents_failed;

                        // Keep the load view in sync with what actually moved
                        let mut calc = self.load_calculator.lock();
                        if let Some(m) = calc.node_metrics(&decision.source_node).cloned() {
                            calc.set_document_count(
                                &decision.source_node,
                                m.document_count.saturating_sub(result.documents_migrated),
                            );
                        }
                        if let Some(m) = calc.node_metrics(&decision.target_node).cloned() {
                            calc.set_document_count(
                                &decision.target_node,
                                m.document_count + result.documents_migrated,
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("migration for {} failed: {}", decision.source_node, e),
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            operation.error_message = Some(e.to_string());
            error!("rebalance {} failed: {}", operation_id, e);
        }

        operation.status = RebalanceStatus::Idle;
        operation.completed_at = Some(Utc::now());

        *self.last_rebalance_mono.lock() = Some(Instant::now());
        *self.last_rebalance_wall.lock() = Some(Utc::now());
        *self.status.write() = RebalanceStatus::Idle;

        self.events.publish(ClusterEvent::RebalanceCompleted {
            operation_id: operation_id.clone(),
            documents_moved: operation.documents_moved,
            documents_failed: operation.documents_failed,
        });
        info!(
            "rebalance {} completed: {} moved, {} failed",
            operation_id, operation.documents_moved, operation.documents_failed
        );

        self.history.lock().push(operation.clone());
        Ok(operation)
    }

    async fn execute_decision(
        &self,
        decision: &RebalanceDecision,
    ) -> anyhow::Result<Option<MigrationResult>> {
        let selector = self.document_selector.read().clone();
        let Some(selector) = selector else {
            warn!("no document selector configured, skipping decision");
            return Ok(None);
        };

        let doc_ids = selector(decision.source_node.clone(), decision.documents_to_move).await?;
        if doc_ids.is_empty() {
            warn!(
                "no documents selected for migration from {}",
                decision.source_node
            );
            return Ok(None);
        }

        let task = self.migration_handler.create_task(
            decision.source_node.clone(),
            decision.target_node.clone(),
            doc_ids,
        );
        let result = self.migration_handler.execute_task(&task.task_id).await?;
        Ok(Some(result))
    }

    pub fn pause(&self) -> bool {
        let mut status = self.status.write();
        if *status == RebalanceStatus::Executing {
            *status = RebalanceStatus::Paused;
            true
        } else {
            false
        }
    }

    pub fn resume(&self) -> bool {
        let mut status = self.status.write();
        if *status == RebalanceStatus::Paused {
            *status = RebalanceStatus::Executing;
            true
        } else {
            false
        }
    }

    /// Trigger an immediate check outside the periodic schedule.
    pub fn force_check(self: &Arc<Self>) {
        if self.running.load(AtomicOrdering::SeqCst) && self.status() == RebalanceStatus::Idle {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.check_and_rebalance().await {
                    error!("forced rebalance check failed: {}", e);
                }
            });
        }
    }

    pub fn operation_history(&self, limit: usize) -> Vec<RebalanceOperation> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn statistics(&self) -> RebalancerStatistics {
        let history = self.history.lock();
        RebalancerStatistics {
            status: self.status(),
            is_running: self.running.load(AtomicOrdering::SeqCst),
            is_in_cooldown: self.is_in_cooldown(),
            total_operations: history.len(),
            total_documents_moved: history.iter().map(|op| op.documents_moved).sum(),
            total_documents_failed: history.iter().map(|op| op.documents_failed).sum(),
            last_rebalance: *self.last_rebalance_wall.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::noop_transfer;
    use futures::FutureExt;
    use vantagedb_core::types::DocumentId;

    fn selector() -> DocumentSelectorFn {
        Arc::new(|node: NodeId, count: usize| {
            async move {
                Ok((0..count)
                    .map(|i| DocumentId(format!("{}_doc_{}", node, i)))
                    .collect())
            }
            .boxed()
        })
    }

    fn rebalancer() -> Arc<ActiveRebalancer> {
        let r = Arc::new(ActiveRebalancer::new(
            RebalancerSettings {
                migration: MigrationSettings {
                    batch_delay_sec: 0.01,
                    ..Default::default()
                },
                ..Default::default()
            },
            EventBus::default(),
        ));
        r.set_document_selector(selector());
        r.set_transfer_function(noop_transfer());
        r
    }

    #[tokio::test]
    async fn test_rebalance_moves_excess_documents() {
        let r = rebalancer();
        r.register_node(NodeId::from("n1"), 500, 100);
        r.register_node(NodeId::from("n2"), 500, 100);
        r.register_node(NodeId::from("n3"), 500, 100);
        r.register_node(NodeId::from("n4"), 500, 400);

        let (needed, _) = r.needs_rebalance();
        assert!(needed);

        let operation = r.execute_rebalance().await.unwrap();
        assert_eq!(operation.documents_moved, 225);
        assert_eq!(operation.documents_failed, 0);
        assert!(!operation.migration_tasks.is_empty());

        // Load spread must not grow after a rebalance
        let summary = r.cluster_summary();
        assert!(summary.load_std_dev < 0.05);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_back_to_back_runs() {
        let r = rebalancer();
        r.register_node(NodeId::from("n1"), 500, 50);
        r.register_node(NodeId::from("n2"), 500, 450);

        r.execute_rebalance().await.unwrap();
        assert!(r.is_in_cooldown());

        // The periodic check path refuses during cooldown
        r.check_and_rebalance().await.unwrap();
        assert_eq!(r.statistics().total_operations, 1);
    }

    #[tokio::test]
    async fn test_balanced_cluster_produces_empty_operation() {
        let r = rebalancer();
        r.register_node(NodeId::from("n1"), 500, 100);
        r.register_node(NodeId::from("n2"), 500, 100);

        let operation = r.execute_rebalance().await.unwrap();
        assert!(operation.decisions.is_empty());
        assert_eq!(operation.documents_moved, 0);
    }

    #[tokio::test]
    async fn test_missing_selector_skips_gracefully() {
        let r = Arc::new(ActiveRebalancer::new(
            RebalancerSettings::default(),
            EventBus::default(),
        ));
        r.set_transfer_function(noop_transfer());
        r.register_node(NodeId::from("n1"), 500, 400);
        r.register_node(NodeId::from("n2"), 500, 50);

        let operation = r.execute_rebalance().await.unwrap();
        assert_eq!(operation.documents_moved, 0);
        assert!(!operation.decisions.is_empty());
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let r = Arc::new(ActiveRebalancer::new(
            RebalancerSettings {
                migration: MigrationSettings {
                    batch_delay_sec: 0.0,
                    ..Default::default()
                },
                ..Default::default()
            },
            bus,
        ));
        r.set_document_selector(selector());
        r.set_transfer_function(noop_transfer());
        r.register_node(NodeId::from("n1"), 500, 400);
        r.register_node(NodeId::from("n2"), 500, 50);

        r.execute_rebalance().await.unwrap();

        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ClusterEvent::RebalanceStarted { .. } => saw_started = true,
                ClusterEvent::RebalanceCompleted { .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_started && saw_completed);
    }
}
