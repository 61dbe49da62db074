//! Bully leader election.
//!
//! The node with the highest id wins. A node that loses sight of the
//! leader challenges every higher-id peer with ELECTION; any of them that
//! answers OK takes over the challenge, and whoever ends up unchallenged
//! broadcasts COORDINATOR. Message delivery goes through an injectable
//! transport so the same algorithm runs over UDP in production and over
//! channels in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vantagedb_core::events::{ClusterEvent, EventBus};
use vantagedb_core::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    Idle,
    ElectionInProgress,
    WaitingCoordinator,
    IsCoordinator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ElectionMessage {
    Election { from: NodeId },
    ElectionOk { from: NodeId },
    Coordinator { from: NodeId, new_leader: NodeId },
}

/// Delivers election messages to a peer. Implementations carry the wire
/// protocol; the algorithm never sees addresses.
pub trait ElectionTransport: Send + Sync {
    fn send(&self, to: NodeId, message: ElectionMessage) -> BoxFuture<'static, anyhow::Result<()>>;
}

#[derive(Debug, Clone)]
pub struct ElectionSettings {
    pub election_timeout_sec: f64,
    pub coordinator_timeout_sec: f64,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            election_timeout_sec: 5.0,
            coordinator_timeout_sec: 10.0,
        }
    }
}

pub type LeaderChangeCallback = Arc<dyn Fn(NodeId) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionStatus {
    pub node_id: NodeId,
    pub state: ElectionState,
    pub is_leader: bool,
    pub current_leader: Option<NodeId>,
    pub peer_count: usize,
}

pub struct BullyElection {
    node_id: NodeId,
    settings: ElectionSettings,
    transport: Arc<dyn ElectionTransport>,
    events: EventBus,

    state: RwLock<ElectionState>,
    current_leader: RwLock<Option<NodeId>>,
    /// peer id -> eligible to lead
    peers: RwLock<HashMap<NodeId, bool>>,

    got_ok: watch::Sender<u64>,
    got_coordinator: watch::Sender<u64>,

    on_become_leader: RwLock<Option<LeaderChangeCallback>>,
    on_new_leader: RwLock<Option<LeaderChangeCallback>>,
}

impl BullyElection {
    pub fn new(
        node_id: NodeId,
        settings: ElectionSettings,
        transport: Arc<dyn ElectionTransport>,
        events: EventBus,
    ) -> Self {
        let (got_ok, _) = watch::channel(0);
        let (got_coordinator, _) = watch::channel(0);

        Self {
            node_id,
            settings,
            transport,
            events,
            state: RwLock::new(ElectionState::Idle),
            current_leader: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            got_ok,
            got_coordinator,
            on_become_leader: RwLock::new(None),
            on_new_leader: RwLock::new(None),
        }
    }

    pub fn set_become_leader_callback(&self, f: LeaderChangeCallback) {
        *self.on_become_leader.write() = Some(f);
    }

    pub fn set_new_leader_callback(&self, f: LeaderChangeCallback) {
        *self.on_new_leader.write() = Some(f);
    }

    pub fn add_peer(&self, node_id: NodeId, can_lead: bool) {
        self.peers.write().insert(node_id, can_lead);
    }

    pub fn remove_peer(&self, node_id: &NodeId) {
        self.peers.write().remove(node_id);
    }

    pub fn is_leader(&self) -> bool {
        self.current_leader.read().as_ref() == Some(&self.node_id)
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.current_leader.read().clone()
    }

    pub fn state(&self) -> ElectionState {
        *self.state.read()
    }

    /// Seed the initially known leader without running an election.
    pub fn set_initial_leader(&self, leader: NodeId) {
        let is_self = leader == self.node_id;
        *self.current_leader.write() = Some(leader);
        *self.state.write() = if is_self {
            ElectionState::IsCoordinator
        } else {
            ElectionState::Idle
        };
    }

    fn higher_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .peers
            .read()
            .iter()
            .filter(|(id, can_lead)| **can_lead && **id > self.node_id)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Run an election to completion. Loops on coordinator-announcement
    /// timeouts rather than recursing.
    pub async fn start_election(self: &Arc<Self>) {
        if *self.state.read() == ElectionState::ElectionInProgress {
            debug!("election already in progress");
            return;
        }

        loop {
            info!("node {} starting election", self.node_id);
            *self.state.write() = ElectionState::ElectionInProgress;

            let ok_baseline = *self.got_ok.borrow();
            let coordinator_baseline = *self.got_coordinator.borrow();

            let higher = self.higher_peers();
            if higher.is_empty() {
                self.become_coordinator().await;
                return;
            }

            for peer in &higher {
                let message = ElectionMessage::Election {
                    from: self.node_id.clone(),
                };
                if let Err(e) = self.transport.send(peer.clone(), message).await {
                    debug!("election send to {} failed: {}", peer, e);
                }
            }

            let got_ok = self
                .wait_for_signal(&self.got_ok, ok_baseline, self.settings.election_timeout_sec)
                .await;
            if !got_ok {
                info!("no higher node answered, claiming leadership");
                self.become_coordinator().await;
                return;
            }

            *self.state.write() = ElectionState::WaitingCoordinator;
            let announced = self
                .wait_for_signal(
                    &self.got_coordinator,
                    coordinator_baseline,
                    self.settings.coordinator_timeout_sec,
                )
                .await;
            if announced {
                return;
            }

            warn!("coordinator announcement timed out, restarting election");
            *self.state.write() = ElectionState::Idle;
        }
    }

    async fn wait_for_signal(&self, sender: &watch::Sender<u64>, baseline: u64, timeout_sec: f64) -> bool {
        let mut receiver = sender.subscribe();
        if *receiver.borrow() > baseline {
            return true;
        }
        tokio::time::timeout(Duration::from_secs_f64(timeout_sec), async move {
            while receiver.changed().await.is_ok() {
                if *receiver.borrow() > baseline {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    async fn become_coordinator(&self) {
        *self.state.write() = ElectionState::IsCoordinator;
        *self.current_leader.write() = Some(self.node_id.clone());

        info!("node {} is the new leader", self.node_id);
        self.events.publish(ClusterEvent::LeaderElected {
            leader: self.node_id.clone(),
        });

        let peers: Vec<NodeId> = self.peers.read().keys().cloned().collect();
        for peer in peers {
            let message = ElectionMessage::Coordinator {
                from: self.node_id.clone(),
                new_leader: self.node_id.clone(),
            };
            if let Err(e) = self.transport.send(peer.clone(), message).await {
                debug!("coordinator send to {} failed: {}", peer, e);
            }
        }

        let callback = self.on_become_leader.read().clone();
        if let Some(callback) = callback {
            callback(self.node_id.clone()).await;
        }
    }

    /// Feed an incoming election message into the state machine.
    pub async fn handle_message(self: &Arc<Self>, message: ElectionMessage) {
        match message {
            ElectionMessage::Election { from } => {
                debug!("{}: ELECTION from {}", self.node_id, from);
                if self.node_id > from {
                    let reply = ElectionMessage::ElectionOk {
                        from: self.node_id.clone(),
                    };
                    if let Err(e) = self.transport.send(from.clone(), reply).await {
                        debug!("ok send to {} failed: {}", from, e);
                    }

                    if *self.state.read() == ElectionState::Idle {
                        let this = Arc::clone(self);
                        tokio::spawn(async move {
                            this.start_election().await;
                        });
                    }
                }
            }
            ElectionMessage::ElectionOk { from } => {
                debug!("{}: OK from {}", self.node_id, from);
                self.got_ok.send_modify(|v| *v += 1);
            }
            ElectionMessage::Coordinator { from: _, new_leader } => {
                info!("{}: new leader announced: {}", self.node_id, new_leader);
                let is_self = new_leader == self.node_id;
                *self.current_leader.write() = Some(new_leader.clone());
                *self.state.write() = if is_self {
                    ElectionState::IsCoordinator
                } else {
                    ElectionState::Idle
                };
                self.got_coordinator.send_modify(|v| *v += 1);

                if !is_self {
                    let callback = self.on_new_leader.read().clone();
                    if let Some(callback) = callback {
                        callback(new_leader).await;
                    }
                }
            }
        }
    }

    pub fn status(&self) -> ElectionStatus {
        ElectionStatus {
            node_id: self.node_id.clone(),
            state: self.state(),
            is_leader: self.is_leader(),
            current_leader: self.current_leader(),
            peer_count: self.peers.read().len(),
        }
    }
}

/// In-process transport delivering messages straight to registered
/// elections; used by tests and single-process clusters.
#[derive(Default)]
pub struct InMemoryElectionHub {
    nodes: RwLock<HashMap<NodeId, std::sync::Weak<BullyElection>>>,
    /// Partitioned nodes drop all traffic
    unreachable: RwLock<Vec<NodeId>>,
}

impl InMemoryElectionHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node_id: NodeId, election: &Arc<BullyElection>) {
        self.nodes.write().insert(node_id, Arc::downgrade(election));
    }

    pub fn set_unreachable(&self, node_id: NodeId) {
        self.unreachable.write().push(node_id);
    }

    pub fn set_reachable(&self, node_id: &NodeId) {
        self.unreachable.write().retain(|id| id != node_id);
    }
}

impl ElectionTransport for Arc<InMemoryElectionHub> {
    fn send(&self, to: NodeId, message: ElectionMessage) -> BoxFuture<'static, anyhow::Result<()>> {
        let hub = Arc::clone(self);
        Box::pin(async move {
            if hub.unreachable.read().contains(&to) {
                anyhow::bail!("node {} unreachable", to);
            }
            let target = hub
                .nodes
                .read()
                .get(&to)
                .and_then(|weak| weak.upgrade());
            match target {
                Some(election) => {
                    tokio::spawn(async move {
                        election.handle_message(message).await;
                    });
                    Ok(())
                }
                None => anyhow::bail!("node {} not registered", to),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(ids: &[&str]) -> (Arc<InMemoryElectionHub>, Vec<Arc<BullyElection>>) {
        let hub = InMemoryElectionHub::new();
        let settings = ElectionSettings {
            election_timeout_sec: 0.2,
            coordinator_timeout_sec: 0.5,
        };

        let elections: Vec<Arc<BullyElection>> = ids
            .iter()
            .map(|id| {
                Arc::new(BullyElection::new(
                    NodeId::from(*id),
                    settings.clone(),
                    Arc::new(Arc::clone(&hub)),
                    EventBus::default(),
                ))
            })
            .collect();

        for election in &elections {
            hub.register(election.status().node_id.clone(), election);
        }
        for a in &elections {
            for b in &elections {
                let b_id = b.status().node_id.clone();
                if a.status().node_id != b_id {
                    a.add_peer(b_id, true);
                }
            }
        }

        (hub, elections)
    }

    #[tokio::test]
    async fn test_highest_id_wins() {
        let (_hub, elections) = cluster(&["n1", "n2", "n3"]);

        elections[0].start_election().await;

        // Give the message cascade time to settle
        tokio::time::sleep(Duration::from_millis(800)).await;

        for election in &elections {
            assert_eq!(election.current_leader(), Some(NodeId::from("n3")));
        }
        assert!(elections[2].is_leader());
        assert!(!elections[0].is_leader());
    }

    #[tokio::test]
    async fn test_highest_node_claims_immediately() {
        let (_hub, elections) = cluster(&["n1", "n2", "n3"]);

        elections[2].start_election().await;
        assert!(elections[2].is_leader());
        assert_eq!(elections[2].state(), ElectionState::IsCoordinator);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(elections[0].current_leader(), Some(NodeId::from("n3")));
    }

    #[tokio::test]
    async fn test_election_with_highest_node_down() {
        let (hub, elections) = cluster(&["n1", "n2", "n3"]);
        hub.set_unreachable(NodeId::from("n3"));

        elections[0].start_election().await;
        tokio::time::sleep(Duration::from_millis(800)).await;

        // n2 is the highest reachable node
        assert_eq!(elections[0].current_leader(), Some(NodeId::from("n2")));
        assert!(elections[1].is_leader());
    }

    #[tokio::test]
    async fn test_initial_leader_seeding() {
        let (_hub, elections) = cluster(&["n1", "n2"]);
        elections[0].set_initial_leader(NodeId::from("n2"));

        assert_eq!(elections[0].current_leader(), Some(NodeId::from("n2")));
        assert!(!elections[0].is_leader());
        assert_eq!(elections[0].state(), ElectionState::Idle);
    }

    #[tokio::test]
    async fn test_leader_elected_event_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let hub = InMemoryElectionHub::new();
        let election = Arc::new(BullyElection::new(
            NodeId::from("n1"),
            ElectionSettings {
                election_timeout_sec: 0.1,
                coordinator_timeout_sec: 0.1,
            },
            Arc::new(Arc::clone(&hub)),
            bus,
        ));
        hub.register(NodeId::from("n1"), &election);

        election.start_election().await;

        match rx.recv().await.unwrap() {
            ClusterEvent::LeaderElected { leader } => assert_eq!(leader, NodeId::from("n1")),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
