//! # VantageDB Failure Detection and Recovery
//!
//! Keeps the cluster's data reachable through node loss:
//!
//! - [`failure_detector`]: heartbeat monitoring with a per-node state
//!   machine (UNKNOWN, HEALTHY, SUSPECT, FAILED, RECOVERING) and
//!   callbacks on failure and recovery transitions.
//! - [`re_replication`]: a priority repair queue that restores the
//!   replication factor of documents orphaned by a failure, copying from
//!   a surviving replica to a freshly selected target.
//! - [`recovery_service`]: the workflow glue: on a FAILED transition it
//!   assesses impact, promotes replicas where the dead node was primary,
//!   queues repairs and verifies the queue drains within the configured
//!   window.

pub mod failure_detector;
pub mod re_replication;
pub mod recovery_service;

pub use failure_detector::{
    DetectorStatistics, FailureDetector, FailureDetectorSettings, FailureEvent, NodeHealth,
    NodeStatus,
};
pub use re_replication::{
    ReReplicationManager, ReReplicationSettings, ReReplicationStatistics, RepairStatus, RepairTask,
};
pub use recovery_service::{
    DocumentsOnNodeFn, PromoteReplicaFn, RecoveryPhase, RecoveryService, RecoverySettings,
    RecoveryStatistics, RecoveryTask,
};
