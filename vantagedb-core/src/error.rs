use thiserror::Error;

use crate::types::{DocumentId, NodeId};

/// Typed failures surfaced by the placement and coordination core.
///
/// Transient I/O problems are retried inside the owning task and reported as
/// counts; these variants cover resource exhaustion and invariant violations
/// that callers must be able to match on.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no healthy nodes available for assignment")]
    NoHealthyNodes,

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("unknown document: {0}")]
    UnknownDocument(DocumentId),

    #[error("no replica of {document} on node {node}")]
    ReplicaNotFound { document: DocumentId, node: NodeId },

    #[error("task queue saturated ({pending} pending)")]
    QueueSaturated { pending: usize },

    #[error("transfer from {from} to {target} timed out after {timeout_sec}s")]
    TransferTimeout {
        from: NodeId,
        target: NodeId,
        timeout_sec: f64,
    },

    #[error("partition index not initialized")]
    NotInitialized,

    #[error("writes unavailable in {mode} mode")]
    WritesUnavailable { mode: String },
}

pub type CoreResult<T> = Result<T, CoreError>;
