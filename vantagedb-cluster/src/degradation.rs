//! Graceful degradation management.
//!
//! Folds bootstrap state and adaptive configuration into a single set of
//! capability flags. The system never stops serving: capabilities shrink
//! as the cluster shrinks and grow back when nodes return, and dependent
//! components are notified through registered callbacks on every level
//! change.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};

use vantagedb_core::events::{ClusterEvent, EventBus};
use vantagedb_core::types::NodeId;

use crate::adaptive_config::{
    AdaptiveClusterConfig, AdaptiveClusterManager, OperationMode,
};
use crate::bootstrap::{BootstrapSettings, BootstrapStatus, SingleNodeBootstrap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DegradationLevel {
    /// Full functionality
    None = 0,
    /// Slightly reduced redundancy
    Minimal = 1,
    /// Reduced replication or quorum
    Moderate = 2,
    /// Single node or minority partition
    Significant = 3,
    /// Read-only or severely limited
    Critical = 4,
}

impl DegradationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::None => "none",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Moderate => "moderate",
            DegradationLevel::Significant => "significant",
            DegradationLevel::Critical => "critical",
        }
    }
}

/// What the system can currently do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCapabilities {
    pub can_read: bool,
    pub can_write: bool,
    pub can_replicate: bool,
    pub can_rebalance: bool,
    pub strong_consistency_available: bool,
    pub fault_tolerance_level: usize,
}

impl Default for SystemCapabilities {
    fn default() -> Self {
        Self {
            can_read: true,
            can_write: true,
            can_replicate: false,
            can_rebalance: false,
            strong_consistency_available: false,
            fault_tolerance_level: 0,
        }
    }
}

pub type DegradationCallback =
    Arc<dyn Fn(DegradationLevel, SystemCapabilities) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationStatus {
    pub node_id: NodeId,
    pub degradation_level: String,
    pub capabilities: SystemCapabilities,
    pub operation_mode: OperationMode,
    pub cluster_size: usize,
    pub is_leader: bool,
    pub bootstrap: BootstrapStatus,
    pub summary: String,
}

pub struct GracefulDegradationManager {
    node_id: NodeId,
    cluster: Mutex<AdaptiveClusterManager>,
    pub bootstrap: Arc<SingleNodeBootstrap>,

    level: RwLock<DegradationLevel>,
    capabilities: RwLock<SystemCapabilities>,
    callbacks: RwLock<Vec<DegradationCallback>>,
    events: EventBus,

    running: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl GracefulDegradationManager {
    pub fn new(
        bootstrap_settings: BootstrapSettings,
        target_nodes: usize,
        target_replication: usize,
        events: EventBus,
    ) -> Arc<Self> {
        let node_id = bootstrap_settings.node_id.clone();
        let config = AdaptiveClusterConfig::new(target_nodes, target_replication);

        Arc::new(Self {
            node_id,
            cluster: Mutex::new(AdaptiveClusterManager::new(config)),
            bootstrap: Arc::new(SingleNodeBootstrap::new(bootstrap_settings)),
            // Until bootstrap finishes the system counts as degraded
            level: RwLock::new(DegradationLevel::Significant),
            capabilities: RwLock::new(SystemCapabilities::default()),
            callbacks: RwLock::new(Vec::new()),
            events,
            running: AtomicBool::new(false),
            monitor: Mutex::new(None),
        })
    }

    pub fn on_degradation_change(&self, callback: DegradationCallback) {
        self.callbacks.write().push(callback);
    }

    pub fn degradation_level(&self) -> DegradationLevel {
        *self.level.read()
    }

    pub fn capabilities(&self) -> SystemCapabilities {
        *self.capabilities.read()
    }

    pub fn cluster_config(&self) -> AdaptiveClusterConfig {
        self.cluster.lock().config.clone()
    }

    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        self.cluster.lock().healthy_nodes().to_vec()
    }

    pub async fn start(self: &Arc<Self>) -> DegradationStatus {
        self.running.store(true, AtomicOrdering::SeqCst);

        self.bootstrap.start().await;
        // The local node always counts toward the healthy set
        self.cluster
            .lock()
            .node_joined(self.node_id.clone(), String::new());
        self.update_degradation_level().await;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if !this.running.load(AtomicOrdering::SeqCst) {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
                this.update_degradation_level().await;
            }
        });
        *self.monitor.lock() = Some(handle);

        info!(
            "degradation manager started at level {}",
            self.degradation_level().as_str()
        );
        self.status()
    }

    pub async fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        self.bootstrap.stop().await;
        info!("degradation manager stopped");
    }

    pub async fn node_joined(&self, node_id: NodeId, address: String) -> DegradationStatus {
        self.cluster.lock().node_joined(node_id.clone(), address);
        if self.bootstrap.is_leader() {
            let _ = self.bootstrap.handle_node_join(node_id.clone()).await;
        }
        self.events.publish(ClusterEvent::NodeJoined { node: node_id });
        self.update_degradation_level().await;
        self.status()
    }

    pub async fn node_left(&self, node_id: &NodeId, reason: &str) -> DegradationStatus {
        self.cluster.lock().node_left(node_id, reason);
        self.bootstrap.handle_node_leave(node_id).await;
        self.events.publish(ClusterEvent::NodeLeft {
            node: node_id.clone(),
            reason: reason.to_string(),
        });
        self.update_degradation_level().await;
        self.status()
    }

    pub async fn node_failed(&self, node_id: &NodeId) -> DegradationStatus {
        self.cluster.lock().node_failed(node_id);
        self.events.publish(ClusterEvent::NodeFailed {
            node: node_id.clone(),
        });
        self.update_degradation_level().await;
        self.status()
    }

    pub async fn node_recovered(&self, node_id: &NodeId) -> DegradationStatus {
        self.cluster.lock().node_recovered(node_id);
        self.events.publish(ClusterEvent::NodeRecovered {
            node: node_id.clone(),
        });
        self.update_degradation_level().await;
        self.status()
    }

    /// Report a partition observed by the communication layer.
    pub async fn handle_partition(
        &self,
        reachable: &[NodeId],
        total_known: usize,
    ) -> DegradationStatus {
        self.cluster
            .lock()
            .config
            .handle_partition(reachable, total_known);
        self.update_degradation_level().await;
        self.status()
    }

    pub async fn heal_partition(&self, all_nodes: &[NodeId]) -> DegradationStatus {
        self.cluster.lock().config.heal_partition(all_nodes);
        self.update_degradation_level().await;
        self.status()
    }

    /// Recompute level + capability flags from the adaptive config and
    /// notify listeners when the level moved.
    async fn update_degradation_level(&self) {
        let config = self.cluster.lock().config.clone();
        let old_level = *self.level.read();

        let (level, capabilities) = derive_capabilities(&config);

        *self.level.write() = level;
        *self.capabilities.write() = capabilities;

        if old_level != level {
            info!(
                "degradation level changed: {} -> {}",
                old_level.as_str(),
                level.as_str()
            );
            self.events.publish(ClusterEvent::CapabilityChanged {
                degradation_level: level.as_str().to_string(),
            });

            let callbacks = self.callbacks.read().clone();
            for callback in callbacks {
                // A listener's failure must not block the others
                let result =
                    tokio::spawn(async move { callback(level, capabilities).await }).await;
                if let Err(e) = result {
                    error!("degradation callback panicked: {}", e);
                }
            }
        }
    }

    /// Check whether an operation is allowed right now.
    pub fn check_operation_allowed(&self, operation: &str) -> (bool, String) {
        let capabilities = self.capabilities();
        let (allowed, reason) = match operation {
            "write" => (capabilities.can_write, "writes disabled in current state"),
            "read" => (capabilities.can_read, "reads disabled"),
            "replicate" => (
                capabilities.can_replicate,
                "replication unavailable (insufficient nodes)",
            ),
            "rebalance" => (
                capabilities.can_rebalance,
                "rebalancing unavailable (insufficient nodes)",
            ),
            "strong_read" => (
                capabilities.strong_consistency_available,
                "strong consistency unavailable (no quorum)",
            ),
            _ => (true, ""),
        };

        if allowed {
            (true, "operation allowed".to_string())
        } else {
            (false, reason.to_string())
        }
    }

    pub fn status(&self) -> DegradationStatus {
        let config = self.cluster.lock().config.clone();
        let level = self.degradation_level();
        DegradationStatus {
            node_id: self.node_id.clone(),
            degradation_level: level.as_str().to_string(),
            capabilities: self.capabilities(),
            operation_mode: config.operation_mode,
            cluster_size: config.current_nodes,
            is_leader: self.bootstrap.is_leader(),
            bootstrap: self.bootstrap.status(),
            summary: summary_for(level).to_string(),
        }
    }
}

fn derive_capabilities(config: &AdaptiveClusterConfig) -> (DegradationLevel, SystemCapabilities) {
    match config.operation_mode {
        OperationMode::Readonly => (
            DegradationLevel::Critical,
            SystemCapabilities {
                can_read: true,
                can_write: false,
                can_replicate: false,
                can_rebalance: false,
                strong_consistency_available: false,
                fault_tolerance_level: 0,
            },
        ),
        OperationMode::SingleNode => (
            DegradationLevel::Significant,
            SystemCapabilities {
                can_read: true,
                can_write: true,
                can_replicate: false,
                can_rebalance: false,
                strong_consistency_available: false,
                fault_tolerance_level: 0,
            },
        ),
        // A minority partition keeps serving but cannot coordinate
        OperationMode::Partitioned => (
            DegradationLevel::Significant,
            SystemCapabilities {
                can_read: true,
                can_write: true,
                can_replicate: config.effective_replication_factor > 0,
                can_rebalance: false,
                strong_consistency_available: false,
                fault_tolerance_level: config.fault_tolerance(),
            },
        ),
        OperationMode::Degraded => {
            if config.effective_replication_factor > 0 {
                (
                    DegradationLevel::Moderate,
                    SystemCapabilities {
                        can_read: true,
                        can_write: true,
                        can_replicate: true,
                        can_rebalance: true,
                        strong_consistency_available: config.current_nodes >= 3,
                        fault_tolerance_level: config.fault_tolerance(),
                    },
                )
            } else {
                (
                    DegradationLevel::Significant,
                    SystemCapabilities {
                        can_read: true,
                        can_write: true,
                        can_replicate: false,
                        can_rebalance: false,
                        strong_consistency_available: false,
                        fault_tolerance_level: 0,
                    },
                )
            }
        }
        OperationMode::Normal => {
            let level = if config.effective_replication_factor
                >= config.target_replication_factor
            {
                DegradationLevel::None
            } else {
                DegradationLevel::Minimal
            };
            (
                level,
                SystemCapabilities {
                    can_read: true,
                    can_write: true,
                    can_replicate: true,
                    can_rebalance: true,
                    strong_consistency_available: true,
                    fault_tolerance_level: config.fault_tolerance(),
                },
            )
        }
    }
}

fn summary_for(level: DegradationLevel) -> &'static str {
    match level {
        DegradationLevel::None => "system fully operational",
        DegradationLevel::Minimal => "operational with slightly reduced redundancy",
        DegradationLevel::Moderate => "operational with reduced replication",
        DegradationLevel::Significant => "running in single-node or limited mode",
        DegradationLevel::Critical => "read-only or critical state",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn manager(target_nodes: usize) -> Arc<GracefulDegradationManager> {
        GracefulDegradationManager::new(
            BootstrapSettings::new(NodeId::from("n1"), "h1:1".to_string()),
            target_nodes,
            2,
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn test_single_node_start_capabilities() {
        let m = manager(3);
        let status = m.start().await;

        assert_eq!(status.operation_mode, OperationMode::SingleNode);
        assert_eq!(status.degradation_level, "significant");
        assert!(status.capabilities.can_read);
        assert!(status.capabilities.can_write);
        assert!(!status.capabilities.can_replicate);
        assert_eq!(status.capabilities.fault_tolerance_level, 0);
        assert!(status.is_leader);
        m.stop().await;
    }

    #[tokio::test]
    async fn test_growth_to_target_reaches_full_capability() {
        let m = manager(3);
        m.start().await;

        let status = m.node_joined(NodeId::from("n2"), "h2:1".into()).await;
        assert_eq!(status.operation_mode, OperationMode::Degraded);
        assert_eq!(status.capabilities.fault_tolerance_level, 1);

        let status = m.node_joined(NodeId::from("n3"), "h3:1".into()).await;
        assert_eq!(status.operation_mode, OperationMode::Normal);
        assert_eq!(status.degradation_level, "none");
        assert_eq!(status.capabilities.fault_tolerance_level, 2);
        assert!(status.capabilities.strong_consistency_available);
        m.stop().await;
    }

    #[tokio::test]
    async fn test_minority_partition_keeps_read_write() {
        let m = manager(5);
        m.start().await;
        for i in 2..=5 {
            m.node_joined(NodeId(format!("n{}", i)), format!("h{}:1", i)).await;
        }

        let reachable = vec![NodeId::from("n1"), NodeId::from("n2")];
        let status = m.handle_partition(&reachable, 5).await;

        assert_eq!(status.operation_mode, OperationMode::Partitioned);
        assert!(status.capabilities.can_read);
        assert!(status.capabilities.can_write);
        assert!(!status.capabilities.strong_consistency_available);

        let all: Vec<NodeId> = (1..=5).map(|i| NodeId(format!("n{}", i))).collect();
        let status = m.heal_partition(&all).await;
        assert_eq!(status.operation_mode, OperationMode::Normal);
        m.stop().await;
    }

    #[tokio::test]
    async fn test_callbacks_fire_on_level_change() {
        let m = manager(3);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        m.on_degradation_change(Arc::new(move |_level, _caps| {
            let fired = Arc::clone(&fired_clone);
            async move {
                fired.fetch_add(1, AtomicOrdering::SeqCst);
            }
            .boxed()
        }));

        m.start().await;
        m.node_joined(NodeId::from("n2"), "h2:1".into()).await;
        m.node_joined(NodeId::from("n3"), "h3:1".into()).await;

        // significant -> moderate -> none
        assert!(fired.load(AtomicOrdering::SeqCst) >= 2);
        m.stop().await;
    }

    #[tokio::test]
    async fn test_check_operation_allowed() {
        let m = manager(3);
        m.start().await;

        let (allowed, _) = m.check_operation_allowed("write");
        assert!(allowed);
        let (allowed, reason) = m.check_operation_allowed("replicate");
        assert!(!allowed);
        assert!(reason.contains("insufficient"));
        m.stop().await;
    }

    #[tokio::test]
    async fn test_failure_shrinks_capabilities() {
        let m = manager(3);
        m.start().await;
        m.node_joined(NodeId::from("n2"), "h2:1".into()).await;
        m.node_joined(NodeId::from("n3"), "h3:1".into()).await;

        let status = m.node_failed(&NodeId::from("n3")).await;
        assert_eq!(status.operation_mode, OperationMode::Degraded);
        assert_eq!(status.capabilities.fault_tolerance_level, 1);

        let status = m.node_recovered(&NodeId::from("n3")).await;
        assert_eq!(status.operation_mode, OperationMode::Normal);
        m.stop().await;
    }
}
