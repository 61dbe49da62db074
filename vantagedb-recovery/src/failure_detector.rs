//! Heartbeat-based failure detection.
//!
//! Per node the detector runs a small state machine: UNKNOWN until the
//! first beat, HEALTHY while beats arrive, SUSPECT after enough misses,
//! FAILED past the failure threshold. A failed node that beats again goes
//! through RECOVERING and needs one more beat to count as HEALTHY, which
//! keeps flapping nodes out of placement decisions for a round.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use vantagedb_core::types::{NodeId, ResourceMetrics};

/// Node health as seen by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Unknown,
    Healthy,
    Suspect,
    Failed,
    Recovering,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub latency_ms: f64,
    pub resources: Option<ResourceMetrics>,
}

impl NodeHealth {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Unknown,
            last_heartbeat: None,
            consecutive_failures: 0,
            last_failure: None,
            latency_ms: 0.0,
            resources: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == NodeStatus::Healthy
    }
}

/// Emitted when a node crosses into FAILED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub node_id: NodeId,
    pub detected_at: DateTime<Utc>,
    pub last_healthy: Option<DateTime<Utc>>,
    pub failure_type: String,
    pub details: String,
}

pub type FailureCallback = Arc<dyn Fn(FailureEvent) -> BoxFuture<'static, ()> + Send + Sync>;
pub type RecoveryCallback = Arc<dyn Fn(NodeId) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FailureDetectorSettings {
    pub heartbeat_interval_sec: f64,
    pub failure_timeout_sec: f64,
    pub suspect_threshold: u32,
    pub failure_threshold: u32,
}

impl Default for FailureDetectorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_sec: 5.0,
            failure_timeout_sec: 15.0,
            suspect_threshold: 2,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorStatistics {
    pub is_running: bool,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub suspect_nodes: usize,
    pub failed_nodes: usize,
    pub total_failures: usize,
}

pub struct FailureDetector {
    settings: FailureDetectorSettings,
    nodes: RwLock<HashMap<NodeId, NodeHealth>>,
    failed_nodes: RwLock<HashSet<NodeId>>,
    failure_history: Mutex<Vec<FailureEvent>>,

    on_failure: RwLock<Vec<FailureCallback>>,
    on_recovery: RwLock<Vec<RecoveryCallback>>,

    running: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl FailureDetector {
    pub fn new(settings: FailureDetectorSettings) -> Self {
        Self {
            settings,
            nodes: RwLock::new(HashMap::new()),
            failed_nodes: RwLock::new(HashSet::new()),
            failure_history: Mutex::new(Vec::new()),
            on_failure: RwLock::new(Vec::new()),
            on_recovery: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            monitor: Mutex::new(None),
        }
    }

    pub fn add_failure_callback(&self, f: FailureCallback) {
        self.on_failure.write().push(f);
    }

    pub fn add_recovery_callback(&self, f: RecoveryCallback) {
        self.on_recovery.write().push(f);
    }

    pub fn register_node(&self, node_id: NodeId) {
        info!("monitoring node {}", node_id);
        self.nodes
            .write()
            .entry(node_id.clone())
            .or_insert_with(|| NodeHealth::new(node_id));
    }

    pub fn unregister_node(&self, node_id: &NodeId) {
        self.nodes.write().remove(node_id);
        self.failed_nodes.write().remove(node_id);
        info!("stopped monitoring {}", node_id);
    }

    /// Record a heartbeat. FAILED nodes pass through RECOVERING and need a
    /// second beat to stabilize back to HEALTHY.
    pub fn record_heartbeat(
        &self,
        node_id: &NodeId,
        latency_ms: f64,
        resources: Option<ResourceMetrics>,
    ) {
        let mut recovered = false;
        {
            let mut nodes = self.nodes.write();
            let health = nodes
                .entry(node_id.clone())
                .or_insert_with(|| NodeHealth::new(node_id.clone()));

            let previous = health.status;
            health.last_heartbeat = Some(Utc::now());
            health.consecutive_failures = 0;
            health.latency_ms = latency_ms;
            if resources.is_some() {
                health.resources = resources;
            }

            health.status = match previous {
                NodeStatus::Failed => {
                    recovered = true;
                    NodeStatus::Recovering
                }
                NodeStatus::Recovering => NodeStatus::Healthy,
                _ => NodeStatus::Healthy,
            };
        }

        if recovered {
            self.failed_nodes.write().remove(node_id);
            info!("node {} recovering", node_id);
            for callback in self.on_recovery.read().iter().cloned() {
                let node = node_id.clone();
                tokio::spawn(async move { callback(node).await });
            }
        }
    }

    /// Record an explicitly failed health check.
    pub fn record_failure(&self, node_id: &NodeId, error: &str) {
        let event = {
            let mut nodes = self.nodes.write();
            let Some(health) = nodes.get_mut(node_id) else {
                return;
            };

            health.consecutive_failures += 1;
            health.last_failure = Some(Utc::now());

            if health.consecutive_failures >= self.settings.failure_threshold {
                if health.status != NodeStatus::Failed {
                    Some(self.mark_failed(health, "error", error))
                } else {
                    None
                }
            } else if health.consecutive_failures >= self.settings.suspect_threshold {
                health.status = NodeStatus::Suspect;
                warn!(
                    "node {} suspect ({} failures)",
                    node_id, health.consecutive_failures
                );
                None
            } else {
                None
            }
        };

        if let Some(event) = event {
            self.dispatch_failure(event);
        }
    }

    fn mark_failed(&self, health: &mut NodeHealth, failure_type: &str, details: &str) -> FailureEvent {
        health.status = NodeStatus::Failed;
        self.failed_nodes.write().insert(health.node_id.clone());

        let event = FailureEvent {
            node_id: health.node_id.clone(),
            detected_at: Utc::now(),
            last_healthy: health.last_heartbeat,
            failure_type: failure_type.to_string(),
            details: details.to_string(),
        };

        error!("node {} marked FAILED ({})", health.node_id, failure_type);
        self.failure_history.lock().push(event.clone());
        event
    }

    fn dispatch_failure(&self, event: FailureEvent) {
        for callback in self.on_failure.read().iter().cloned() {
            let event = event.clone();
            tokio::spawn(async move { callback(event).await });
        }
    }

    /// Sweep all nodes for heartbeat timeouts. Public so tests and manual
    /// probes can force a check outside the timer.
    pub fn check_all_nodes(&self) {
        let timeout = chrono::Duration::milliseconds(
            (self.settings.failure_timeout_sec * 1000.0) as i64,
        );
        let now = Utc::now();
        let mut events = Vec::new();

        {
            let mut nodes = self.nodes.write();
            for health in nodes.values_mut() {
                if health.status == NodeStatus::Failed {
                    continue;
                }

                let missed = match health.last_heartbeat {
                    Some(at) => now - at > timeout,
                    // Never heard from at all
                    None => true,
                };
                if !missed {
                    continue;
                }

                health.consecutive_failures += 1;
                if health.consecutive_failures >= self.settings.failure_threshold {
                    let details = match health.last_heartbeat {
                        Some(at) => format!(
                            "no heartbeat for {:.1}s",
                            (now - at).num_milliseconds() as f64 / 1000.0
                        ),
                        None => "never received heartbeat".to_string(),
                    };
                    let failure_type = if health.last_heartbeat.is_some() {
                        "timeout"
                    } else {
                        "no_heartbeat"
                    };
                    events.push(self.mark_failed(health, failure_type, &details));
                } else if health.consecutive_failures >= self.settings.suspect_threshold {
                    health.status = NodeStatus::Suspect;
                }
            }
        }

        for event in events {
            self.dispatch_failure(event);
        }
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
                this.check_all_nodes();
                tokio::time::sleep(Duration::from_secs_f64(
                    this.settings.heartbeat_interval_sec,
                ))
                .await;
            }
        });
        *self.monitor.lock() = Some(handle);
        info!("failure detector started");
    }

    pub async fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        info!("failure detector stopped");
    }

    pub fn node_health(&self, node_id: &NodeId) -> Option<NodeHealth> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn all_health(&self) -> HashMap<NodeId, NodeHealth> {
        self.nodes.read().clone()
    }

    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .nodes
            .read()
            .values()
            .filter(|h| h.is_healthy())
            .map(|h| h.node_id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn failed_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.failed_nodes.read().iter().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn suspect_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .nodes
            .read()
            .values()
            .filter(|h| h.status == NodeStatus::Suspect)
            .map(|h| h.node_id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn is_node_healthy(&self, node_id: &NodeId) -> bool {
        self.nodes
            .read()
            .get(node_id)
            .map(|h| h.is_healthy())
            .unwrap_or(false)
    }

    pub fn failure_history(&self, limit: usize) -> Vec<FailureEvent> {
        let history = self.failure_history.lock();
        history.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn statistics(&self) -> DetectorStatistics {
        let nodes = self.nodes.read();
        DetectorStatistics {
            is_running: self.running.load(AtomicOrdering::SeqCst),
            total_nodes: nodes.len(),
            healthy_nodes: nodes.values().filter(|h| h.is_healthy()).count(),
            suspect_nodes: nodes
                .values()
                .filter(|h| h.status == NodeStatus::Suspect)
                .count(),
            failed_nodes: self.failed_nodes.read().len(),
            total_failures: self.failure_history.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn detector() -> Arc<FailureDetector> {
        Arc::new(FailureDetector::new(FailureDetectorSettings {
            heartbeat_interval_sec: 0.05,
            failure_timeout_sec: 0.1,
            suspect_threshold: 2,
            failure_threshold: 3,
        }))
    }

    #[tokio::test]
    async fn test_first_heartbeat_moves_unknown_to_healthy() {
        let d = detector();
        d.register_node(NodeId::from("n1"));
        assert_eq!(d.node_health(&NodeId::from("n1")).unwrap().status, NodeStatus::Unknown);

        d.record_heartbeat(&NodeId::from("n1"), 1.0, None);
        assert!(d.is_node_healthy(&NodeId::from("n1")));
    }

    #[tokio::test]
    async fn test_suspect_then_failed_progression() {
        let d = detector();
        d.register_node(NodeId::from("n1"));
        d.record_heartbeat(&NodeId::from("n1"), 1.0, None);

        d.record_failure(&NodeId::from("n1"), "probe error");
        assert_eq!(d.node_health(&NodeId::from("n1")).unwrap().status, NodeStatus::Healthy);

        d.record_failure(&NodeId::from("n1"), "probe error");
        assert_eq!(d.node_health(&NodeId::from("n1")).unwrap().status, NodeStatus::Suspect);

        d.record_failure(&NodeId::from("n1"), "probe error");
        assert_eq!(d.node_health(&NodeId::from("n1")).unwrap().status, NodeStatus::Failed);
        assert_eq!(d.failed_nodes(), vec![NodeId::from("n1")]);
    }

    #[tokio::test]
    async fn test_timeout_sweep_marks_failed() {
        let d = detector();
        d.register_node(NodeId::from("n1"));
        d.record_heartbeat(&NodeId::from("n1"), 1.0, None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Three sweeps past the timeout reach the failure threshold
        d.check_all_nodes();
        d.check_all_nodes();
        d.check_all_nodes();

        assert_eq!(d.node_health(&NodeId::from("n1")).unwrap().status, NodeStatus::Failed);
    }

    #[tokio::test]
    async fn test_recovery_requires_stabilization_beat() {
        let d = detector();
        d.register_node(NodeId::from("n1"));
        for _ in 0..3 {
            d.record_failure(&NodeId::from("n1"), "down");
        }
        assert_eq!(d.node_health(&NodeId::from("n1")).unwrap().status, NodeStatus::Failed);

        d.record_heartbeat(&NodeId::from("n1"), 1.0, None);
        assert_eq!(
            d.node_health(&NodeId::from("n1")).unwrap().status,
            NodeStatus::Recovering
        );
        assert!(!d.is_node_healthy(&NodeId::from("n1")));

        d.record_heartbeat(&NodeId::from("n1"), 1.0, None);
        assert!(d.is_node_healthy(&NodeId::from("n1")));
    }

    #[tokio::test]
    async fn test_failure_callback_fires_once() {
        let d = detector();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        d.add_failure_callback(Arc::new(move |event: FailureEvent| {
            let fired = Arc::clone(&fired_clone);
            async move {
                assert_eq!(event.node_id, NodeId::from("n1"));
                fired.fetch_add(1, AtomicOrdering::SeqCst);
            }
            .boxed()
        }));

        d.register_node(NodeId::from("n1"));
        for _ in 0..5 {
            d.record_failure(&NodeId::from("n1"), "down");
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_heartbeats_keep_node_healthy_under_monitor() {
        let d = detector();
        d.register_node(NodeId::from("n1"));
        d.start();

        for _ in 0..5 {
            d.record_heartbeat(&NodeId::from("n1"), 1.0, None);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        assert!(d.is_node_healthy(&NodeId::from("n1")));
        d.stop().await;
    }
}
