//! Typed interfaces to external collaborators.
//!
//! The core never talks to the network directly. Transfers, replication,
//! document selection and peer probing are supplied by the hosting process
//! as boxed async closures, which keeps the placement engine testable and
//! the wire protocol out of this crate.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::types::{DocumentId, NodeId};

/// Outcome of a batched document transfer between two nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub migrated: Vec<DocumentId>,
    pub failed: Vec<DocumentId>,
}

/// Replica placement as reported by the replica-info probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaProbe {
    pub primary: Option<NodeId>,
    /// replica node -> status string as tracked by the replica tracker
    pub replicas: HashMap<NodeId, String>,
    pub healthy_nodes: Vec<NodeId>,
}

/// Moves a batch of documents from source to target. Must be idempotent on
/// the target and honor the configured transfer timeout.
pub type TransferFn = Arc<
    dyn Fn(NodeId, NodeId, Vec<DocumentId>) -> BoxFuture<'static, Result<TransferOutcome>>
        + Send
        + Sync,
>;

/// Copies one document from source to target, returning success.
pub type ReplicateFn =
    Arc<dyn Fn(DocumentId, NodeId, NodeId) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Picks `count` documents on a node for migration (e.g. least recently
/// accessed). The selection policy belongs to the caller.
pub type DocumentSelectorFn =
    Arc<dyn Fn(NodeId, usize) -> BoxFuture<'static, Result<Vec<DocumentId>>> + Send + Sync>;

/// Looks up the current replica placement of a document.
pub type ReplicaInfoFn =
    Arc<dyn Fn(DocumentId) -> BoxFuture<'static, Result<Option<ReplicaProbe>>> + Send + Sync>;

/// Selects a target node for a new replica, excluding the given nodes.
pub type TargetSelectorFn =
    Arc<dyn Fn(DocumentId, Vec<NodeId>) -> BoxFuture<'static, Result<Option<NodeId>>> + Send + Sync>;

/// Probes a seed address for an existing cluster; returns the leader id if
/// one answered.
pub type SeedProbeFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Option<NodeId>>> + Send + Sync>;

/// Pushes a locally accepted write to peers once connectivity returns.
pub type PeerSyncFn =
    Arc<dyn Fn(DocumentId, serde_json::Value) -> BoxFuture<'static, Result<bool>> + Send + Sync>;
