//! # VantageDB Semantic-Affinity Replication
//!
//! Replication subsystem for the VantageDB cluster. Every document keeps a
//! configurable number of copies, and new replicas are placed where the
//! document's semantic neighborhood already lives:
//!
//! - [`similarity_graph`]: undirected weighted graph over documents;
//!   replica candidates are scored by the summed similarity of neighbors
//!   they already store.
//! - [`replica_tracker`]: authoritative map of document -> primary +
//!   replicas with status, version and under-replication tracking. The
//!   at-most-one-active-primary invariant lives here.
//! - [`affinity`]: the replication manager: target selection, a strict
//!   priority queue (CRITICAL / HIGH / NORMAL / LOW, FIFO within each),
//!   a bounded worker pool with linear retry backoff, and node-failure
//!   fan-out (promotion plus HIGH-priority repair).
//! - [`adaptive`]: scales the effective replication factor with cluster
//!   size (`min(target, n - 1)`), accepts writes unreplicated when alone,
//!   and upgrades old documents once new nodes join.

pub mod adaptive;
pub mod affinity;
pub mod replica_tracker;
pub mod similarity_graph;

pub use adaptive::{AdaptiveReplicationState, AdaptiveReplicator, AdaptiveReplicatorStatus};
pub use affinity::{
    AffinityReplicator, ReplicationPriority, ReplicationSettings, ReplicationTask,
    ReplicatorStatistics,
};
pub use replica_tracker::{
    DocumentReplicas, ReplicaInfo, ReplicaStatus, ReplicaTracker, TrackerStatistics,
};
pub use similarity_graph::{BundleDistanceFn, GraphDocument, GraphStatistics, SimilarityGraph};
