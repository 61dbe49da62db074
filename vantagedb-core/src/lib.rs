//! # VantageDB Core Types and Contracts
//!
//! Shared foundation for the VantageDB distributed semantic document search
//! cluster. This crate defines the vocabulary every other subsystem speaks:
//!
//! - **Identity types**: [`types::DocumentId`], [`types::NodeId`],
//!   [`types::PartitionId`] string newtypes with stable ordering (node id
//!   order is load-bearing for election and tie-breaking).
//! - **Data model**: [`types::Document`] with its precomputed
//!   [`types::VectorBundle`] (TF-IDF name vector, MinHash signature, topic
//!   distribution) and the [`types::ClusterNode`] membership record with
//!   derived load factors.
//! - **Configuration**: [`config::VantageConfig`], one section per
//!   subsystem, JSON-backed with defaults.
//! - **Events**: [`events::ClusterEvent`] broadcast to collaborators over
//!   [`events::EventBus`].
//! - **External collaborator interfaces**: typed async callbacks in
//!   [`callbacks`] for transfers, replication, document selection, replica
//!   probing and peer sync. The core never opens sockets itself.
//! - **Typed errors**: [`error::CoreError`] for resource exhaustion and
//!   invariant violations that callers match on.
//! - **Snapshots**: [`snapshot::SnapshotStore`], sled-backed persistence of
//!   the partition-assignment table and replica placements.

pub mod callbacks;
pub mod config;
pub mod error;
pub mod events;
pub mod snapshot;
pub mod types;

pub use callbacks::{
    DocumentSelectorFn, PeerSyncFn, ReplicaInfoFn, ReplicaProbe, ReplicateFn, SeedProbeFn,
    TargetSelectorFn, TransferFn, TransferOutcome,
};
pub use config::VantageConfig;
pub use error::{CoreError, CoreResult};
pub use events::{ClusterEvent, EventBus};
pub use snapshot::{ReplicaSetSnapshot, SnapshotStore};
pub use types::{
    ClusterNode, Document, DocumentId, NodeHealthStatus, NodeId, PartitionId, ResourceMetrics,
    VectorBundle,
};
