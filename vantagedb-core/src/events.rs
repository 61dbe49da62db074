use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{DocumentId, NodeId};

/// Cluster-state facts published to collaborating subsystems.
///
/// Consumers subscribe through [`EventBus::subscribe`]; a lagging consumer
/// drops old events rather than blocking publishers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterEvent {
    NodeJoined { node: NodeId },
    NodeLeft { node: NodeId, reason: String },
    NodeFailed { node: NodeId },
    NodeRecovered { node: NodeId },
    LeaderElected { leader: NodeId },
    DocumentReplicated { document: DocumentId, target: NodeId },
    RebalanceStarted { operation_id: String },
    RebalanceCompleted {
        operation_id: String,
        documents_moved: usize,
        documents_failed: usize,
    },
    CapabilityChanged { degradation_level: String },
}

/// Broadcast fan-out for [`ClusterEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; silently dropped when nobody is subscribed.
    pub fn publish(&self, event: ClusterEvent) {
        debug!("cluster event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
