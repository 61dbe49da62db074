//! Durable snapshots of placement state.
//!
//! Two tables survive restarts: the partition-assignment table
//! (leaf id -> cluster node) and the replica-tracker snapshot
//! (document -> primary + replicas). Both are stored as JSON payloads in
//! named sled trees; the wire format is internal to this node.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{DocumentId, NodeId, PartitionId};

const PARTITION_TREE: &str = "partition_assignments";
const REPLICA_TREE: &str = "replica_sets";

/// Replica placement of one document as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSetSnapshot {
    pub primary: Option<NodeId>,
    pub replicas: Vec<NodeId>,
    pub replication_factor: usize,
}

/// Sled-backed store for placement snapshots.
pub struct SnapshotStore {
    db: sled::Db,
}

impl SnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        info!("snapshot store opened");
        Ok(Self { db })
    }

    /// Temporary in-memory store for tests.
    pub fn ephemeral() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn save_partition_assignments(
        &self,
        assignments: &HashMap<PartitionId, NodeId>,
    ) -> Result<()> {
        let tree = self.db.open_tree(PARTITION_TREE)?;
        tree.clear()?;
        for (partition, node) in assignments {
            tree.insert(partition.0.as_bytes(), serde_json::to_vec(node)?)?;
        }
        tree.flush()?;
        debug!("persisted {} partition assignments", assignments.len());
        Ok(())
    }

    pub fn load_partition_assignments(&self) -> Result<HashMap<PartitionId, NodeId>> {
        let tree = self.db.open_tree(PARTITION_TREE)?;
        let mut assignments = HashMap::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let partition = PartitionId(String::from_utf8(key.to_vec())?);
            let node: NodeId = serde_json::from_slice(&value)?;
            assignments.insert(partition, node);
        }
        Ok(assignments)
    }

    pub fn save_replica_set(
        &self,
        document: &DocumentId,
        snapshot: &ReplicaSetSnapshot,
    ) -> Result<()> {
        let tree = self.db.open_tree(REPLICA_TREE)?;
        tree.insert(document.0.as_bytes(), serde_json::to_vec(snapshot)?)?;
        Ok(())
    }

    pub fn save_replica_sets(
        &self,
        snapshots: &HashMap<DocumentId, ReplicaSetSnapshot>,
    ) -> Result<()> {
        let tree = self.db.open_tree(REPLICA_TREE)?;
        tree.clear()?;
        for (document, snapshot) in snapshots {
            tree.insert(document.0.as_bytes(), serde_json::to_vec(snapshot)?)?;
        }
        tree.flush()?;
        debug!("persisted {} replica sets", snapshots.len());
        Ok(())
    }

    pub fn load_replica_sets(&self) -> Result<HashMap<DocumentId, ReplicaSetSnapshot>> {
        let tree = self.db.open_tree(REPLICA_TREE)?;
        let mut snapshots = HashMap::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let document = DocumentId(String::from_utf8(key.to_vec())?);
            let snapshot: ReplicaSetSnapshot = serde_json::from_slice(&value)?;
            snapshots.insert(document, snapshot);
        }
        Ok(snapshots)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_assignment_round_trip() {
        let store = SnapshotStore::ephemeral().unwrap();

        let mut assignments = HashMap::new();
        assignments.insert(PartitionId::from("vpn_1"), NodeId::from("n1"));
        assignments.insert(PartitionId::from("vpn_2"), NodeId::from("n2"));

        store.save_partition_assignments(&assignments).unwrap();
        let loaded = store.load_partition_assignments().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&PartitionId::from("vpn_1")], NodeId::from("n1"));
    }

    #[test]
    fn test_replica_set_round_trip() {
        let store = SnapshotStore::ephemeral().unwrap();

        let snapshot = ReplicaSetSnapshot {
            primary: Some(NodeId::from("n1")),
            replicas: vec![NodeId::from("n2"), NodeId::from("n3")],
            replication_factor: 2,
        };
        store
            .save_replica_set(&DocumentId::from("doc-1"), &snapshot)
            .unwrap();

        let loaded = store.load_replica_sets().unwrap();
        let entry = &loaded[&DocumentId::from("doc-1")];
        assert_eq!(entry.primary, Some(NodeId::from("n1")));
        assert_eq!(entry.replicas.len(), 2);
    }

    #[test]
    fn test_save_overwrites_previous_state() {
        let store = SnapshotStore::ephemeral().unwrap();

        let mut first = HashMap::new();
        first.insert(PartitionId::from("vpn_1"), NodeId::from("n1"));
        store.save_partition_assignments(&first).unwrap();

        let mut second = HashMap::new();
        second.insert(PartitionId::from("vpn_9"), NodeId::from("n2"));
        store.save_partition_assignments(&second).unwrap();

        let loaded = store.load_partition_assignments().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&PartitionId::from("vpn_9")));
    }
}
