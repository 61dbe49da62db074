//! Availability-first read/write surface.
//!
//! The CAP choice of this system is explicit: availability and partition
//! tolerance, giving up linearizability. Reads always answer from local
//! state with a freshness tag; writes are always accepted locally with a
//! sync status, and a background reconciler pushes un-synced writes to
//! peers once connectivity returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vantagedb_core::callbacks::PeerSyncFn;
use vantagedb_core::types::{DocumentId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    Fresh,
    PotentiallyStale,
    Stale,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Committed,
    Pending,
    WillSyncLater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    Connected,
    Partitioned,
    Healing,
}

/// Result of a read; `success` is always true by contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResult {
    pub success: bool,
    pub value: Option<serde_json::Value>,
    pub freshness: Freshness,
    pub version: u64,
    pub read_at: DateTime<Utc>,
}

/// Result of a write; `accepted` is always true by contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResult {
    pub accepted: bool,
    pub sync_status: SyncStatus,
    pub version: u64,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: serde_json::Value,
    version: u64,
    updated_at: DateTime<Utc>,
    synced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub node_id: NodeId,
    pub mode: String,
    pub partition_status: PartitionStatus,
    pub is_majority: bool,
    pub entries: usize,
    pub pending_sync: usize,
    pub is_running: bool,
}

pub struct PartitionTolerantStore {
    node_id: NodeId,
    data: DashMap<DocumentId, StoredEntry>,
    pending: Mutex<VecDeque<DocumentId>>,

    partition_status: RwLock<PartitionStatus>,
    is_majority: RwLock<bool>,

    peer_sync: RwLock<Option<PeerSyncFn>>,
    reconcile_interval_sec: f64,

    running: AtomicBool,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionTolerantStore {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            data: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            partition_status: RwLock::new(PartitionStatus::Connected),
            is_majority: RwLock::new(true),
            peer_sync: RwLock::new(None),
            reconcile_interval_sec: 5.0,
            running: AtomicBool::new(false),
            reconciler: Mutex::new(None),
        }
    }

    pub fn with_reconcile_interval(mut self, interval_sec: f64) -> Self {
        self.reconcile_interval_sec = interval_sec;
        self
    }

    pub fn set_peer_sync_function(&self, f: PeerSyncFn) {
        *self.peer_sync.write() = Some(f);
    }

    /// Update the partition view; usually driven by the degradation
    /// manager's cluster facts.
    pub fn set_partition_state(&self, status: PartitionStatus, is_majority: bool) {
        *self.partition_status.write() = status;
        *self.is_majority.write() = is_majority;
        debug!(
            "partition state: {:?}, majority: {}",
            status, is_majority
        );
    }

    pub fn is_partitioned(&self) -> bool {
        *self.partition_status.read() == PartitionStatus::Partitioned
    }

    /// Read never fails. The freshness tag tells the caller how much to
    /// trust the value: FRESH only when connected and synced, UNKNOWN for
    /// keys this node has never seen.
    pub fn read(&self, key: &DocumentId) -> ReadResult {
        let entry = self.data.get(key);

        let freshness = match entry.as_deref() {
            None => Freshness::Unknown,
            Some(entry) => {
                if self.is_partitioned() || !*self.is_majority.read() {
                    if entry.synced {
                        Freshness::PotentiallyStale
                    } else {
                        Freshness::Stale
                    }
                } else if entry.synced {
                    Freshness::Fresh
                } else {
                    Freshness::PotentiallyStale
                }
            }
        };

        ReadResult {
            success: true,
            value: entry.as_deref().map(|e| e.value.clone()),
            freshness,
            version: entry.as_deref().map(|e| e.version).unwrap_or(0),
            read_at: Utc::now(),
        }
    }

    /// Write never blocks on quorum. The value lands locally and the sync
    /// status records how it will reach the rest of the cluster.
    pub fn write(&self, key: DocumentId, value: serde_json::Value) -> WriteResult {
        let has_peers = self.peer_sync.read().is_some();
        let partitioned = self.is_partitioned() || !*self.is_majority.read();

        let version = {
            let mut entry = self.data.entry(key.clone()).or_insert_with(|| StoredEntry {
                value: serde_json::Value::Null,
                version: 0,
                updated_at: Utc::now(),
                synced: false,
            });
            entry.value = value;
            entry.version += 1;
            entry.updated_at = Utc::now();
            entry.synced = !has_peers;
            entry.version
        };

        let sync_status = if !has_peers {
            // Nothing to sync to: the local copy is the cluster state
            SyncStatus::Committed
        } else {
            self.pending.lock().push_back(key.clone());
            if partitioned {
                SyncStatus::WillSyncLater
            } else {
                SyncStatus::Pending
            }
        };

        debug!("accepted write of {} ({:?})", key, sync_status);
        WriteResult {
            accepted: true,
            sync_status,
            version,
            written_at: Utc::now(),
        }
    }

    pub fn pending_sync_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Push pending writes to peers. Stops early while partitioned in the
    /// minority; requeues anything that fails. Returns synced count.
    pub async fn reconcile(&self) -> usize {
        if self.is_partitioned() && !*self.is_majority.read() {
            return 0;
        }
        let sync = self.peer_sync.read().clone();
        let Some(sync) = sync else {
            return 0;
        };

        let mut synced = 0;
        loop {
            let Some(key) = self.pending.lock().pop_front() else {
                break;
            };

            let value = match self.data.get(&key).as_deref() {
                Some(entry) if !entry.synced => entry.value.clone(),
                // Already synced by a later pass or removed
                _ => continue,
            };

            match sync(key.clone(), value).await {
                Ok(true) => {
                    if let Some(mut entry) = self.data.get_mut(&key) {
                        entry.synced = true;
                    }
                    synced += 1;
                }
                Ok(false) | Err(_) => {
                    warn!("peer sync of {} failed, requeueing", key);
                    self.pending.lock().push_back(key);
                    break;
                }
            }
        }

        if synced > 0 {
            info!("reconciled {} pending writes", synced);
        }
        synced
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, AtomicOrdering::SeqCst) {
            return;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if !this.running.load(AtomicOrdering::SeqCst) {
                    break;
                }
                this.reconcile().await;
                tokio::time::sleep(Duration::from_secs_f64(this.reconcile_interval_sec)).await;
            }
        });
        *self.reconciler.lock() = Some(handle);
        info!("partition-tolerant store started");
    }

    pub async fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        if let Some(handle) = self.reconciler.lock().take() {
            handle.abort();
        }
        info!("partition-tolerant store stopped");
    }

    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            node_id: self.node_id.clone(),
            mode: "AP".to_string(),
            partition_status: *self.partition_status.read(),
            is_majority: *self.is_majority.read(),
            entries: self.data.len(),
            pending_sync: self.pending.lock().len(),
            is_running: self.running.load(AtomicOrdering::SeqCst),
        }
    }
}
