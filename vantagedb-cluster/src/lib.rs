//! # VantageDB Adaptive Cluster Coordination
//!
//! The coordination layer that keeps a VantageDB cluster operating across
//! every size from one node to full strength, and across partitions:
//!
//! - [`adaptive_config`]: effective replication factor, quorum size,
//!   operation mode and consistency level derived from the healthy node
//!   count. The system is availability-first: a minority partition enters
//!   PARTITIONED and keeps serving reads and writes with un-synced writes
//!   instead of going read-only.
//! - [`bootstrap`]: single-node startup, seed discovery, standalone
//!   leadership and the transition to multi-node operation as peers join.
//! - [`election`]: Bully leader election (highest node id wins) over an
//!   injectable transport; elections only run once a peer exists and the
//!   leader is lost.
//! - [`degradation`]: capability flags (`can_read`, `can_write`,
//!   `can_replicate`, `can_rebalance`, strong consistency, fault
//!   tolerance) with change callbacks for dependent components.
//! - [`ap_store`]: the always-available read/write surface: reads carry
//!   freshness tags, writes carry sync status, and a background
//!   reconciler pushes pending writes when connectivity returns.

pub mod adaptive_config;
pub mod ap_store;
pub mod bootstrap;
pub mod degradation;
pub mod election;

pub use adaptive_config::{
    AdaptiveClusterConfig, AdaptiveClusterManager, ConsistencyLevel, OperationMode,
};
pub use ap_store::{
    Freshness, PartitionStatus, PartitionTolerantStore, ReadResult, StoreStatus, SyncStatus,
    WriteResult,
};
pub use bootstrap::{
    BootstrapPhase, BootstrapSettings, BootstrapStatus, SingleNodeBootstrap,
};
pub use degradation::{
    DegradationLevel, DegradationStatus, GracefulDegradationManager, SystemCapabilities,
};
pub use election::{
    BullyElection, ElectionMessage, ElectionSettings, ElectionState, ElectionStatus,
    ElectionTransport, InMemoryElectionHub,
};
