//! # VantageDB
//!
//! Distributed semantic document search cluster. A corpus is spread across
//! a dynamically sized set of storage nodes so that similar documents stay
//! co-located, every document keeps replicas for fault tolerance, and a
//! nearest-neighbor query only touches the few nodes likely to hold
//! relevant results.
//!
//! This crate is the orchestration layer tying the subsystems together:
//!
//! - `vantagedb-index`: composite document distance, VP-tree partitioning,
//!   routing and node assignment
//! - `vantagedb-replication`: semantic-affinity replica placement and the
//!   adaptive replication factor
//! - `vantagedb-rebalance`: load monitoring and rate-limited migrations
//! - `vantagedb-recovery`: heartbeat failure detection, promotion and
//!   re-replication
//! - `vantagedb-cluster`: bootstrap, leader election, graceful degradation
//!   and the availability-first read/write surface
//!
//! [`VantageDb`] wires the failure detector into recovery and degradation,
//! routes ingested documents through the partition manager into the
//! replicator, and publishes cluster events to collaborators. Network
//! primitives (transfer, replicate, peer probing) are injected by the
//! hosting process.

use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vantagedb_cluster::{
    BootstrapSettings, BullyElection, DegradationStatus, ElectionSettings, ElectionTransport,
    GracefulDegradationManager, OperationMode, PartitionStatus, PartitionTolerantStore,
    ReadResult, WriteResult,
};
use vantagedb_core::callbacks::{DocumentSelectorFn, ReplicateFn, SeedProbeFn, TransferFn};
use vantagedb_core::config::VantageConfig;
use vantagedb_core::error::CoreError;
use vantagedb_core::events::EventBus;
use vantagedb_core::snapshot::SnapshotStore;
use vantagedb_core::types::{Document, DocumentId, NodeHealthStatus, NodeId};
use vantagedb_index::{
    BuildStats, DistanceCalculator, DistanceWeights, PartitionManager, PartitionManagerConfig,
    RoutingResult, VantageStrategy,
};
use vantagedb_rebalance::{ActiveRebalancer, MigrationSettings, RebalancerSettings};
use vantagedb_recovery::{
    FailureDetectorSettings, ReReplicationSettings, RecoveryService, RecoverySettings,
};
use vantagedb_replication::{
    AdaptiveReplicator, AffinityReplicator, DocumentReplicas, ReplicationSettings,
};

use parking_lot::RwLock;

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResult {
    pub routing: RoutingResult,
    pub replicas: DocumentReplicas,
}

/// Aggregated node status for operators and collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VantageDbStatus {
    pub node_id: NodeId,
    pub degradation: DegradationStatus,
    pub partitions: vantagedb_index::PartitionManagerStats,
    pub replication: vantagedb_replication::AdaptiveReplicatorStatus,
    pub rebalancer: vantagedb_rebalance::RebalancerStatistics,
    pub recovery: vantagedb_recovery::RecoveryStatistics,
    pub store: vantagedb_cluster::StoreStatus,
}

/// The assembled VantageDB node.
pub struct VantageDb {
    config: VantageConfig,
    node_id: NodeId,
    events: EventBus,

    partitions: Arc<PartitionManager>,
    affinity: Arc<AffinityReplicator>,
    replicator: Arc<AdaptiveReplicator>,
    rebalancer: Arc<ActiveRebalancer>,
    recovery: Arc<RecoveryService>,
    degradation: Arc<GracefulDegradationManager>,
    store: Arc<PartitionTolerantStore>,
    election: RwLock<Option<Arc<BullyElection>>>,
    snapshots: RwLock<Option<SnapshotStore>>,
}

impl VantageDb {
    pub fn new(config: VantageConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let node_id = NodeId::from(config.node.node_id.clone());
        let events = EventBus::default();

        let partitions = Arc::new(PartitionManager::new(PartitionManagerConfig {
            leaf_size: config.index.leaf_size,
            sample_size: config.index.sample_size,
            // Counts total copies, primary included
            replication_factor: config.replication.target_replication_factor + 1,
            weights: DistanceWeights::new(
                config.index.name_weight,
                config.index.content_weight,
                config.index.topic_weight,
            ),
            vantage_strategy: VantageStrategy::KMedoids,
            pruning_slack: config.index.pruning_slack,
            query_neighborhood_radius: config.index.query_neighborhood_radius,
            max_query_partitions: config.index.max_query_partitions,
        }));

        let affinity = Arc::new(AffinityReplicator::new(
            ReplicationSettings {
                replication_factor: config.replication.target_replication_factor + 1,
                max_concurrent_replications: config.replication.max_concurrent_replications,
                replication_timeout_sec: config.replication.replication_timeout_sec,
                retry_count: config.replication.retry_count,
                retry_delay_sec: config.replication.retry_delay_sec,
                check_interval_sec: config.replication.check_interval_sec,
                similarity_threshold: config.replication.similarity_threshold,
                max_neighbors: config.replication.max_neighbors,
            },
            events.clone(),
        ));
        // Graph similarities use the same composite distance as the index
        let distance = DistanceCalculator::new(DistanceWeights::new(
            config.index.name_weight,
            config.index.content_weight,
            config.index.topic_weight,
        ));
        affinity.set_distance_function(Arc::new(move |a, b| distance.weighted_distance(a, b)));

        let replicator = Arc::new(AdaptiveReplicator::new(
            config.replication.target_replication_factor,
            Arc::clone(&affinity),
        ));

        let rebalancer = Arc::new(ActiveRebalancer::new(
            RebalancerSettings {
                imbalance_threshold: config.rebalance.imbalance_threshold,
                critical_threshold: config.rebalance.critical_threshold,
                min_transfer_size: config.rebalance.min_transfer_size,
                check_interval_sec: config.rebalance.check_interval_sec,
                cooldown_after_rebalance_sec: config.rebalance.cooldown_after_rebalance_sec,
                max_documents_per_rebalance: config.rebalance.max_documents_per_rebalance,
                migration: MigrationSettings {
                    batch_size: config.rebalance.batch_size,
                    batch_delay_sec: config.rebalance.batch_delay_sec,
                    max_retries: config.rebalance.max_retries,
                    retry_delay_sec: config.rebalance.retry_delay_sec,
                    transfer_timeout_sec: config.rebalance.transfer_timeout_sec,
                },
            },
            events.clone(),
        ));

        let recovery = RecoveryService::new(RecoverySettings {
            detector: FailureDetectorSettings {
                heartbeat_interval_sec: config.recovery.heartbeat_interval_sec,
                failure_timeout_sec: config.recovery.failure_timeout_sec,
                suspect_threshold: config.recovery.suspect_threshold,
                failure_threshold: config.recovery.failure_threshold,
            },
            re_replication: ReReplicationSettings {
                max_concurrent: config.recovery.max_concurrent_rereplications,
                batch_size: config.recovery.re_replication_batch_size,
                retry_limit: config.recovery.re_replication_retry_limit,
                loop_interval_sec: 1.0,
            },
            assessment_delay_sec: config.recovery.assessment_delay_sec,
            verification_timeout_sec: config.recovery.verification_timeout_sec,
        });

        let mut bootstrap_settings =
            BootstrapSettings::new(node_id.clone(), config.node.address.clone());
        bootstrap_settings.seed_nodes = config.cluster.seed_nodes.clone();
        bootstrap_settings.allow_single_node = config.cluster.allow_single_node;
        bootstrap_settings.max_discovery_attempts = config.cluster.max_discovery_attempts;
        bootstrap_settings.peer_discovery_interval_sec =
            config.cluster.peer_discovery_interval_sec;

        let degradation = GracefulDegradationManager::new(
            bootstrap_settings,
            config.cluster.target_nodes,
            config.replication.target_replication_factor,
            events.clone(),
        );

        let store = Arc::new(PartitionTolerantStore::new(node_id.clone()));

        let db = Arc::new(Self {
            config,
            node_id,
            events,
            partitions,
            affinity,
            replicator,
            rebalancer,
            recovery,
            degradation,
            store,
            election: RwLock::new(None),
            snapshots: RwLock::new(None),
        });

        db.wire_recovery_callbacks();
        db.wire_failure_reactions();

        Ok(db)
    }

    /// Recovery consumes cluster state through the replica tracker.
    fn wire_recovery_callbacks(self: &Arc<Self>) {
        let affinity = Arc::clone(&self.affinity);
        self.recovery
            .set_documents_on_node_function(Arc::new(move |node: NodeId| {
                let affinity = Arc::clone(&affinity);
                async move { Ok(affinity.with_tracker(|t| t.documents_on_node(&node))) }.boxed()
            }));

        let affinity = Arc::clone(&self.affinity);
        self.recovery
            .set_replica_info_function(Arc::new(move |document: DocumentId| {
                let affinity = Arc::clone(&affinity);
                async move {
                    let probe = affinity.with_tracker(|tracker| {
                        tracker.get_document_replicas(&document).map(|doc| {
                            vantagedb_core::callbacks::ReplicaProbe {
                                primary: doc.primary.as_ref().map(|p| p.node_id.clone()),
                                replicas: doc
                                    .replicas
                                    .iter()
                                    .map(|r| {
                                        (
                                            r.node_id.clone(),
                                            format!("{:?}", r.status).to_lowercase(),
                                        )
                                    })
                                    .collect(),
                                healthy_nodes: doc
                                    .all_replicas()
                                    .iter()
                                    .filter(|r| r.is_healthy())
                                    .map(|r| r.node_id.clone())
                                    .collect(),
                            }
                        })
                    });
                    Ok(probe)
                }
                .boxed()
            }));

        let affinity = Arc::clone(&self.affinity);
        self.recovery
            .set_promote_function(Arc::new(move |document: DocumentId, node: NodeId| {
                let affinity = Arc::clone(&affinity);
                async move {
                    Ok(affinity
                        .with_tracker(|t| t.promote_replica_to_primary(&document, &node)))
                }
                .boxed()
            }));

        // Default repair target: least-loaded healthy node outside the
        // current replica set, stable by id.
        let degradation = Arc::clone(&self.degradation);
        let rebalancer = Arc::clone(&self.rebalancer);
        self.recovery
            .set_target_selector(Arc::new(move |_document, exclude: Vec<NodeId>| {
                let degradation = Arc::clone(&degradation);
                let rebalancer = Arc::clone(&rebalancer);
                async move {
                    let mut candidates: Vec<(NodeId, f64)> = degradation
                        .healthy_nodes()
                        .into_iter()
                        .filter(|id| !exclude.contains(id))
                        .map(|id| {
                            let load = rebalancer
                                .load_calculator
                                .lock()
                                .node_metrics(&id)
                                .map(|m| m.load_factor())
                                .unwrap_or(0.0);
                            (id, load)
                        })
                        .collect();
                    candidates.sort_by(|a, b| {
                        a.1.partial_cmp(&b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(&b.0))
                    });
                    Ok(candidates.into_iter().next().map(|(id, _)| id))
                }
                .boxed()
            }));
    }

    /// On a FAILED transition every subsystem has to react, not just the
    /// recovery workflow: capabilities shrink, the replica set fans out
    /// repairs, the load view drops the node, and a lost leader triggers
    /// an election.
    fn wire_failure_reactions(self: &Arc<Self>) {
        let degradation = Arc::clone(&self.degradation);
        let replicator = Arc::clone(&self.replicator);
        let rebalancer = Arc::clone(&self.rebalancer);
        let partitions = Arc::clone(&self.partitions);
        let store = Arc::clone(&self.store);
        let election = Arc::downgrade(self);

        self.recovery
            .failure_detector
            .add_failure_callback(Arc::new(move |event| {
                let degradation = Arc::clone(&degradation);
                let replicator = Arc::clone(&replicator);
                let rebalancer = Arc::clone(&rebalancer);
                let partitions = Arc::clone(&partitions);
                let store = Arc::clone(&store);
                let db = election.clone();
                async move {
                    let node = event.node_id;
                    degradation.node_failed(&node).await;
                    replicator.node_left(&node);
                    rebalancer.set_node_health(&node, false);
                    partitions.update_node_stats(&node, None, Some(NodeHealthStatus::Failed));

                    let config = degradation.cluster_config();
                    store.set_partition_state(
                        if config.is_partitioned {
                            PartitionStatus::Partitioned
                        } else {
                            PartitionStatus::Connected
                        },
                        config.is_majority,
                    );

                    // Leader gone with peers around: elect a replacement
                    if let Some(db) = db.upgrade() {
                        let run_election = {
                            let guard = db.election.read();
                            match guard.as_ref() {
                                Some(election)
                                    if election.current_leader() == Some(node.clone()) =>
                                {
                                    election.remove_peer(&node);
                                    Some(Arc::clone(election))
                                }
                                Some(election) => {
                                    election.remove_peer(&node);
                                    None
                                }
                                None => None,
                            }
                        };
                        if let Some(election) = run_election {
                            warn!("leader {} lost, starting election", node);
                            tokio::spawn(async move { election.start_election().await });
                        }
                    }
                }
                .boxed()
            }));

        let degradation = Arc::clone(&self.degradation);
        let replicator = Arc::clone(&self.replicator);
        let rebalancer = Arc::clone(&self.rebalancer);
        let partitions = Arc::clone(&self.partitions);
        self.recovery
            .failure_detector
            .add_recovery_callback(Arc::new(move |node| {
                let degradation = Arc::clone(&degradation);
                let replicator = Arc::clone(&replicator);
                let rebalancer = Arc::clone(&rebalancer);
                let partitions = Arc::clone(&partitions);
                async move {
                    degradation.node_recovered(&node).await;
                    replicator.node_joined(node.clone());
                    rebalancer.set_node_health(&node, true);
                    partitions.update_node_stats(&node, None, Some(NodeHealthStatus::Healthy));
                }
                .boxed()
            }));
    }

    /// Start every subsystem: bootstrap first (it decides leadership and
    /// initial capabilities), then the background loops.
    pub async fn start(self: &Arc<Self>) -> Result<DegradationStatus> {
        info!("starting VantageDB node {}", self.node_id);

        let status = self.degradation.start().await;

        self.partitions.register_node(
            self.node_id.clone(),
            self.config.node.address.clone(),
            self.config.node.capacity,
        );
        self.rebalancer
            .register_node(self.node_id.clone(), self.config.node.capacity, 0);
        self.recovery.register_node(self.node_id.clone());
        self.replicator.node_joined(self.node_id.clone());

        self.replicator.start();
        self.rebalancer.start();
        self.recovery.start();
        self.store.start();

        info!(
            "VantageDB node {} operational (mode: {})",
            self.node_id, status.operation_mode
        );
        Ok(status)
    }

    pub async fn stop(&self) -> Result<()> {
        info!("stopping VantageDB node {}", self.node_id);
        self.store.stop().await;
        self.recovery.stop().await;
        self.rebalancer.stop().await;
        self.replicator.stop().await;
        self.degradation.stop().await;
        self.persist_state()?;
        info!("VantageDB node {} stopped", self.node_id);
        Ok(())
    }

    // --- membership -----------------------------------------------------

    pub async fn node_joined(
        &self,
        node_id: NodeId,
        address: String,
        capacity: usize,
    ) -> DegradationStatus {
        self.partitions
            .register_node(node_id.clone(), address.clone(), capacity);
        self.rebalancer.register_node(node_id.clone(), capacity, 0);
        self.recovery.register_node(node_id.clone());
        self.replicator.node_joined(node_id.clone());
        if let Some(election) = self.election.read().as_ref() {
            election.add_peer(node_id.clone(), true);
        }

        self.degradation.node_joined(node_id, address).await
    }

    pub async fn node_left(&self, node_id: &NodeId, reason: &str) -> DegradationStatus {
        self.partitions.unregister_node(node_id);
        self.rebalancer.unregister_node(node_id);
        self.recovery.unregister_node(node_id);
        self.replicator.node_left(node_id);
        if let Some(election) = self.election.read().as_ref() {
            election.remove_peer(node_id);
        }

        self.degradation.node_left(node_id, reason).await
    }

    pub fn record_heartbeat(&self, node_id: &NodeId, latency_ms: f64) {
        self.recovery.record_heartbeat(node_id, latency_ms);
    }

    // --- partitioning and search ---------------------------------------

    pub fn build_partitions(&self, documents: Vec<Document>) -> BuildStats {
        let stats = self.partitions.build(documents, None);
        if let Err(e) = self.persist_state() {
            warn!("failed to persist partition state: {}", e);
        }
        stats
    }

    /// Ingest one document: route to a primary, materialize replicas.
    pub fn ingest(&self, document: Document) -> Result<IngestResult, CoreError> {
        let capabilities = self.degradation.capabilities();
        if !capabilities.can_write {
            return Err(CoreError::WritesUnavailable {
                mode: self.degradation.cluster_config().operation_mode.to_string(),
            });
        }

        let mut routing = self.partitions.route(&document)?;
        let replicas = self.replicator.register_document(
            document.id.clone(),
            routing.primary_node.clone(),
            Some(document.vectors.clone()),
            document.size_bytes,
            document.checksum.clone(),
        );
        // The replication manager's placement is authoritative
        routing.replica_nodes = replicas.replicas.iter().map(|r| r.node_id.clone()).collect();

        // Keep the load view current for the rebalancer
        let count = self
            .affinity
            .with_tracker(|t| t.node_document_count(&routing.primary_node));
        self.rebalancer
            .set_document_count(&routing.primary_node, count);
        self.affinity.update_node_load(
            &routing.primary_node,
            count as f64 / self.config.node.capacity.max(1) as f64,
        );
        self.affinity.drain_queue();

        Ok(IngestResult { routing, replicas })
    }

    pub fn nearest(&self, query: &Document, k: usize) -> Vec<(Document, f64)> {
        self.partitions.nearest(query, k, None)
    }

    pub fn in_range(&self, query: &Document, radius: f64) -> Vec<(Document, f64)> {
        self.partitions.in_range(query, radius)
    }

    pub fn nodes_for_query(&self, query: &Document) -> Vec<NodeId> {
        self.partitions.nodes_for_query(query)
    }

    pub fn needs_rebalance(&self) -> (bool, String) {
        self.rebalancer.needs_rebalance()
    }

    // --- AP surface -----------------------------------------------------

    pub fn read(&self, key: &DocumentId) -> ReadResult {
        self.store.read(key)
    }

    pub fn write(&self, key: DocumentId, value: serde_json::Value) -> WriteResult {
        self.store.write(key, value)
    }

    // --- partitions (network) ------------------------------------------

    pub async fn handle_partition(
        &self,
        reachable: &[NodeId],
        total_known: usize,
    ) -> DegradationStatus {
        let status = self.degradation.handle_partition(reachable, total_known).await;
        let config = self.degradation.cluster_config();
        self.store.set_partition_state(
            if config.operation_mode == OperationMode::Partitioned {
                PartitionStatus::Partitioned
            } else {
                PartitionStatus::Connected
            },
            config.is_majority,
        );
        status
    }

    pub async fn heal_partition(&self, all_nodes: &[NodeId]) -> DegradationStatus {
        let status = self.degradation.heal_partition(all_nodes).await;
        self.store
            .set_partition_state(PartitionStatus::Connected, true);
        status
    }

    // --- election -------------------------------------------------------

    /// Install a transport and enable Bully elections. The election only
    /// runs once a peer exists and the current leader is lost.
    pub fn enable_election(&self, transport: Arc<dyn ElectionTransport>) -> Arc<BullyElection> {
        let election = Arc::new(BullyElection::new(
            self.node_id.clone(),
            ElectionSettings {
                election_timeout_sec: self.config.cluster.election_timeout_sec,
                coordinator_timeout_sec: self.config.cluster.coordinator_timeout_sec,
            },
            transport,
            self.events.clone(),
        ));
        if let Some(leader) = self.degradation.bootstrap.leader_id() {
            election.set_initial_leader(leader);
        }
        *self.election.write() = Some(Arc::clone(&election));
        election
    }

    // --- collaborators --------------------------------------------------

    pub fn set_transfer_function(&self, f: TransferFn) {
        self.rebalancer.set_transfer_function(f);
    }

    pub fn set_replicate_function(&self, f: ReplicateFn) {
        self.affinity.set_replicate_function(f.clone());
        self.recovery.set_replicate_function(f);
    }

    pub fn set_document_selector(&self, f: DocumentSelectorFn) {
        self.rebalancer.set_document_selector(f);
    }

    pub fn set_seed_probe(&self, f: SeedProbeFn) {
        self.degradation.bootstrap.set_seed_probe(f);
    }

    pub fn set_peer_sync_function(&self, f: vantagedb_core::callbacks::PeerSyncFn) {
        self.store.set_peer_sync_function(f);
    }

    // --- persistence ----------------------------------------------------

    /// Open the snapshot store and restore any previously persisted
    /// placement state.
    pub fn enable_persistence(&self) -> Result<()> {
        let store = SnapshotStore::open(&self.config.node.data_dir)?;

        let assignments = store.load_partition_assignments()?;
        if !assignments.is_empty() {
            info!("restored {} partition assignments", assignments.len());
            self.partitions.import_assignments(assignments);
        }

        *self.snapshots.write() = Some(store);
        Ok(())
    }

    fn persist_state(&self) -> Result<()> {
        let guard = self.snapshots.read();
        let Some(store) = guard.as_ref() else {
            return Ok(());
        };

        store.save_partition_assignments(&self.partitions.export_assignments())?;
        let replica_sets = self.affinity.with_tracker(|t| t.export_state());
        store.save_replica_sets(&replica_sets)?;
        store.flush()?;
        Ok(())
    }

    // --- introspection --------------------------------------------------

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn degradation(&self) -> &Arc<GracefulDegradationManager> {
        &self.degradation
    }

    pub fn replicator(&self) -> &Arc<AdaptiveReplicator> {
        &self.replicator
    }

    pub fn recovery(&self) -> &Arc<RecoveryService> {
        &self.recovery
    }

    pub fn rebalancer(&self) -> &Arc<ActiveRebalancer> {
        &self.rebalancer
    }

    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }

    pub fn status(&self) -> VantageDbStatus {
        VantageDbStatus {
            node_id: self.node_id.clone(),
            degradation: self.degradation.status(),
            partitions: self.partitions.statistics(),
            replication: self.replicator.status(),
            rebalancer: self.rebalancer.statistics(),
            recovery: self.recovery.statistics(),
            store: self.store.status(),
        }
    }
}
