//! Single-node bootstrap and incremental cluster growth.
//!
//! A starting node probes its seed addresses for an existing cluster. If
//! one answers, it joins as a follower; otherwise (and when single-node
//! operation is allowed) it promotes itself to standalone leader and
//! accepts joiners, transitioning through CLUSTER_FORMING to OPERATIONAL
//! as peers arrive.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vantagedb_core::callbacks::SeedProbeFn;
use vantagedb_core::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapPhase {
    Initializing,
    SingleNode,
    WaitingForPeers,
    ClusterForming,
    Operational,
}

#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub node_id: NodeId,
    pub node_address: String,
    pub seed_nodes: Vec<String>,
    pub peer_discovery_interval_sec: f64,
    pub max_discovery_attempts: u32,
    pub allow_single_node: bool,
}

impl BootstrapSettings {
    pub fn new(node_id: NodeId, node_address: String) -> Self {
        Self {
            node_id,
            node_address,
            seed_nodes: Vec::new(),
            peer_discovery_interval_sec: 10.0,
            max_discovery_attempts: 3,
            allow_single_node: true,
        }
    }
}

pub type LeaderCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
pub type JoinCallback = Arc<dyn Fn(NodeId) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ClusterFormedCallback = Arc<dyn Fn(Vec<NodeId>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapStatus {
    pub node_id: NodeId,
    pub phase: BootstrapPhase,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub cluster_size: usize,
    pub cluster_nodes: Vec<NodeId>,
    pub started_at: Option<DateTime<Utc>>,
    pub became_leader_at: Option<DateTime<Utc>>,
    pub discovery_attempts: u32,
}

pub struct SingleNodeBootstrap {
    settings: BootstrapSettings,
    seed_probe: RwLock<Option<SeedProbeFn>>,

    phase: RwLock<BootstrapPhase>,
    is_leader: RwLock<bool>,
    leader_id: RwLock<Option<NodeId>>,
    cluster_nodes: RwLock<Vec<NodeId>>,
    discovery_attempts: RwLock<u32>,

    started_at: RwLock<Option<DateTime<Utc>>>,
    became_leader_at: RwLock<Option<DateTime<Utc>>>,

    on_become_leader: RwLock<Option<LeaderCallback>>,
    on_join_cluster: RwLock<Option<JoinCallback>>,
    on_cluster_formed: RwLock<Option<ClusterFormedCallback>>,

    discovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl SingleNodeBootstrap {
    pub fn new(settings: BootstrapSettings) -> Self {
        let own_id = settings.node_id.clone();
        Self {
            settings,
            seed_probe: RwLock::new(None),
            phase: RwLock::new(BootstrapPhase::Initializing),
            is_leader: RwLock::new(false),
            leader_id: RwLock::new(None),
            cluster_nodes: RwLock::new(vec![own_id]),
            discovery_attempts: RwLock::new(0),
            started_at: RwLock::new(None),
            became_leader_at: RwLock::new(None),
            on_become_leader: RwLock::new(None),
            on_join_cluster: RwLock::new(None),
            on_cluster_formed: RwLock::new(None),
            discovery_task: Mutex::new(None),
        }
    }

    pub fn set_seed_probe(&self, f: SeedProbeFn) {
        *self.seed_probe.write() = Some(f);
    }

    pub fn on_become_leader(&self, f: LeaderCallback) {
        *self.on_become_leader.write() = Some(f);
    }

    pub fn on_join_cluster(&self, f: JoinCallback) {
        *self.on_join_cluster.write() = Some(f);
    }

    pub fn on_cluster_formed(&self, f: ClusterFormedCallback) {
        *self.on_cluster_formed.write() = Some(f);
    }

    pub fn phase(&self) -> BootstrapPhase {
        *self.phase.read()
    }

    pub fn is_leader(&self) -> bool {
        *self.is_leader.read()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        let leader = self.leader_id.read().clone();
        leader.or_else(|| {
            if self.is_leader() {
                Some(self.settings.node_id.clone())
            } else {
                None
            }
        })
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_nodes.read().len()
    }

    pub fn cluster_nodes(&self) -> Vec<NodeId> {
        self.cluster_nodes.read().clone()
    }

    /// Run the bootstrap: discover an existing cluster or become a
    /// standalone leader.
    pub async fn start(self: &Arc<Self>) -> BootstrapStatus {
        *self.started_at.write() = Some(Utc::now());
        *self.phase.write() = BootstrapPhase::WaitingForPeers;
        info!("bootstrap starting for node {}", self.settings.node_id);

        for attempt in 0..self.settings.max_discovery_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs_f64(
                    self.settings.peer_discovery_interval_sec,
                ))
                .await;
            }
            *self.discovery_attempts.write() = attempt + 1;

            if let Some(leader) = self.discover_cluster().await {
                self.join_existing_cluster(leader).await;
                return self.status();
            }
            if self.settings.seed_nodes.is_empty() {
                // Nothing to probe; retrying is pointless
                break;
            }
        }

        if self.settings.allow_single_node {
            self.become_standalone_leader().await;
        } else {
            // Keep looking in the background until a cluster appears
            info!("single-node mode disabled, continuing discovery");
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs_f64(
                        this.settings.peer_discovery_interval_sec,
                    ))
                    .await;
                    if let Some(leader) = this.discover_cluster().await {
                        this.join_existing_cluster(leader).await;
                        break;
                    }
                }
            });
            *self.discovery_task.lock() = Some(handle);
        }

        self.status()
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.discovery_task.lock().take() {
            handle.abort();
        }
        info!("bootstrap stopped");
    }

    async fn discover_cluster(&self) -> Option<NodeId> {
        let probe = self.seed_probe.read().clone()?;

        for seed in &self.settings.seed_nodes {
            match probe(seed.clone()).await {
                Ok(Some(leader)) => {
                    info!("found existing cluster via {}, leader {}", seed, leader);
                    return Some(leader);
                }
                Ok(None) => {}
                Err(e) => warn!("seed probe {} failed: {}", seed, e),
            }
        }
        None
    }

    async fn become_standalone_leader(&self) {
        *self.is_leader.write() = true;
        *self.leader_id.write() = Some(self.settings.node_id.clone());
        *self.became_leader_at.write() = Some(Utc::now());
        *self.phase.write() = BootstrapPhase::SingleNode;

        info!(
            "node {} operating as standalone leader",
            self.settings.node_id
        );

        let callback = self.on_become_leader.read().clone();
        if let Some(callback) = callback {
            callback().await;
        }
    }

    async fn join_existing_cluster(&self, leader: NodeId) {
        *self.is_leader.write() = false;
        *self.leader_id.write() = Some(leader.clone());
        *self.phase.write() = BootstrapPhase::Operational;

        info!(
            "node {} joined cluster led by {}",
            self.settings.node_id, leader
        );

        let callback = self.on_join_cluster.read().clone();
        if let Some(callback) = callback {
            callback(leader).await;
        }
    }

    /// Accept a join request (leader side). Moves the cluster out of
    /// single-node operation once the first peer arrives.
    pub async fn handle_node_join(&self, node_id: NodeId) -> Result<BootstrapStatus, String> {
        if !self.is_leader() {
            return Err(format!(
                "not the leader; current leader is {:?}",
                self.leader_id()
            ));
        }

        let formed = {
            let mut nodes = self.cluster_nodes.write();
            if nodes.contains(&node_id) {
                false
            } else {
                nodes.push(node_id.clone());

                let mut phase = self.phase.write();
                if *phase == BootstrapPhase::SingleNode {
                    *phase = BootstrapPhase::ClusterForming;
                    info!("transitioning from single-node to cluster formation");
                }
                if nodes.len() >= 2 {
                    *phase = BootstrapPhase::Operational;
                    true
                } else {
                    false
                }
            }
        };

        if formed {
            let callback = self.on_cluster_formed.read().clone();
            if let Some(callback) = callback {
                callback(self.cluster_nodes()).await;
            }
        }

        info!("node {} joined, cluster size {}", node_id, self.cluster_size());
        Ok(self.status())
    }

    /// A member left. Dropping back to one node re-enters SINGLE_NODE;
    /// losing the leader clears leadership until the next election.
    pub async fn handle_node_leave(&self, node_id: &NodeId) -> BootstrapStatus {
        {
            let mut nodes = self.cluster_nodes.write();
            nodes.retain(|id| id != node_id);

            if nodes.len() == 1 {
                *self.phase.write() = BootstrapPhase::SingleNode;
                info!("reverted to single-node operation");
            }
        }

        if self.leader_id.read().as_ref() == Some(node_id) {
            *self.leader_id.write() = None;
            *self.is_leader.write() = false;
        }

        info!("node {} left, cluster size {}", node_id, self.cluster_size());
        self.status()
    }

    pub fn status(&self) -> BootstrapStatus {
        BootstrapStatus {
            node_id: self.settings.node_id.clone(),
            phase: self.phase(),
            is_leader: self.is_leader(),
            leader_id: self.leader_id(),
            cluster_size: self.cluster_size(),
            cluster_nodes: self.cluster_nodes(),
            started_at: *self.started_at.read(),
            became_leader_at: *self.became_leader_at.read(),
            discovery_attempts: *self.discovery_attempts.read(),
        }
    }
}
