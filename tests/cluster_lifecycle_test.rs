//! Cluster lifecycle integration tests.
//!
//! Exercises the assembled node end to end: single-node startup,
//! incremental growth, failure handling with replica promotion, load
//! rebalancing, semantic search and partition tolerance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::json;

use vantagedb::VantageDb;
use vantagedb_cluster::{Freshness, OperationMode};
use vantagedb_core::config::VantageConfig;
use vantagedb_core::types::{Document, DocumentId, NodeId, VectorBundle};
use vantagedb_replication::ReplicaStatus;

fn test_config(node_id: &str, target_nodes: usize) -> VantageConfig {
    let mut config = VantageConfig::default();
    config.node.node_id = node_id.to_string();
    config.node.capacity = 500;
    config.cluster.target_nodes = target_nodes;
    config.cluster.seed_nodes = Vec::new();
    config.index.leaf_size = 10;
    config.recovery.assessment_delay_sec = 0.0;
    config.recovery.verification_timeout_sec = 2.0;
    config.rebalance.batch_delay_sec = 1.0;
    config
}

fn clustered_doc(id: &str, cluster: usize, offset: f64) -> Document {
    let mut topics = vec![0.02; 5];
    topics[cluster] = 0.9 + offset;
    Document::new(
        id,
        256,
        VectorBundle {
            name_vector: Some(
                [(format!("term_{}", id), 1.0)]
                    .into_iter()
                    .collect::<HashMap<_, _>>(),
            ),
            minhash_signature: Some(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            topic_distribution: Some(topics),
        },
    )
}

fn five_cluster_corpus(per_cluster: usize) -> Vec<Document> {
    let mut docs = Vec::new();
    for cluster in 0..5 {
        for i in 0..per_cluster {
            docs.push(clustered_doc(
                &format!("c{}_d{:03}", cluster, i),
                cluster,
                i as f64 * 0.0004,
            ));
        }
    }
    docs
}

async fn wired_db(node_id: &str, target_nodes: usize) -> Arc<VantageDb> {
    let db = VantageDb::new(test_config(node_id, target_nodes)).unwrap();
    db.set_replicate_function(Arc::new(|_, _, _| async move { Ok(true) }.boxed()));
    db.set_transfer_function(Arc::new(|_, _, docs: Vec<DocumentId>| {
        async move {
            Ok(vantagedb_core::callbacks::TransferOutcome {
                migrated: docs,
                failed: Vec::new(),
            })
        }
        .boxed()
    }));
    db.set_document_selector(Arc::new(|node: NodeId, count: usize| {
        async move {
            Ok((0..count)
                .map(|i| DocumentId(format!("{}_doc_{}", node, i)))
                .collect())
        }
        .boxed()
    }));
    db.start().await.unwrap();
    db
}

#[tokio::test]
async fn test_single_node_start() {
    let db = wired_db("n1", 3).await;
    let status = db.degradation().status();

    assert_eq!(status.operation_mode, OperationMode::SingleNode);
    assert!(status.is_leader);
    assert!(status.capabilities.can_read);
    assert!(status.capabilities.can_write);
    assert!(!status.capabilities.can_replicate);
    assert_eq!(status.capabilities.fault_tolerance_level, 0);
    assert_eq!(db.replicator().replication_factor(), 0);

    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_grow_to_target() {
    let db = wired_db("n1", 3).await;

    let status = db.node_joined(NodeId::from("n2"), "h2:1".into(), 500).await;
    assert_eq!(status.operation_mode, OperationMode::Degraded);
    assert_eq!(db.replicator().replication_factor(), 1);

    let status = db.node_joined(NodeId::from("n3"), "h3:1".into(), 500).await;
    assert_eq!(status.operation_mode, OperationMode::Normal);
    assert_eq!(db.replicator().replication_factor(), 2);
    assert_eq!(status.capabilities.fault_tolerance_level, 2);
    assert!(status.capabilities.can_replicate);
    assert!(status.capabilities.strong_consistency_available);

    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_failure_promotes_replica_and_repairs() {
    let db = wired_db("n1", 3).await;
    db.node_joined(NodeId::from("n2"), "h2:1".into(), 500).await;
    db.node_joined(NodeId::from("n3"), "h3:1".into(), 500).await;

    // Document with primary n1 and active replicas on n2 and n3
    db.replicator().inner().with_tracker(|tracker| {
        tracker.register_document(
            DocumentId::from("doc-1"),
            NodeId::from("n1"),
            vec![NodeId::from("n2"), NodeId::from("n3")],
            Some(2),
            256,
            None,
        );
        for node in ["n2", "n3"] {
            tracker.update_replica_status(
                &DocumentId::from("doc-1"),
                &NodeId::from(node),
                ReplicaStatus::Active,
                None,
            );
        }
    });

    // n1 misses three beats
    for _ in 0..3 {
        db.recovery()
            .failure_detector
            .record_failure(&NodeId::from("n1"), "missed heartbeat");
    }

    // Wait for the recovery workflow to finish
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let recovered = !db.recovery().recovery_history(1).is_empty();
        if recovered || Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let (primary, _) = db
        .replicator()
        .inner()
        .document_locations(&DocumentId::from("doc-1"));
    let primary = primary.expect("document keeps a primary");
    assert!(
        primary == NodeId::from("n2") || primary == NodeId::from("n3"),
        "unexpected primary {}",
        primary
    );

    // The surviving copies keep the document at its effective factor
    let healthy = db.replicator().inner().with_tracker(|tracker| {
        tracker
            .get_document_replicas(&DocumentId::from("doc-1"))
            .unwrap()
            .healthy_count()
    });
    assert!(healthy >= 2, "only {} healthy copies", healthy);

    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_rebalance_skewed_cluster() {
    let db = wired_db("n1", 4).await;
    for node in ["n2", "n3", "n4"] {
        db.node_joined(NodeId::from(node), format!("{}:1", node), 500).await;
    }

    // Skewed counts: [100, 100, 100, 400]
    for (node, count) in [("n1", 100), ("n2", 100), ("n3", 100), ("n4", 400)] {
        db.rebalancer().set_document_count(&NodeId::from(node), count);
    }

    let (needed, _) = db.needs_rebalance();
    assert!(needed);

    let start = Instant::now();
    let operation = db.rebalancer().execute_rebalance().await.unwrap();
    let elapsed = start.elapsed();

    // The overloaded node sheds 225 documents toward 175 each
    assert_eq!(operation.documents_moved, 225);
    for decision in &operation.decisions {
        assert_eq!(decision.source_node, NodeId::from("n4"));
    }
    // 75 documents per decision means two batches with a pause between
    assert!(elapsed >= Duration::from_secs(1));

    let summary = db.rebalancer().cluster_summary();
    assert!(summary.load_std_dev < 0.05);

    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_semantic_search_finds_cluster() {
    let db = wired_db("n1", 3).await;
    db.node_joined(NodeId::from("n2"), "h2:1".into(), 500).await;
    db.node_joined(NodeId::from("n3"), "h3:1".into(), 500).await;

    db.build_partitions(five_cluster_corpus(40));

    let query = clustered_doc("query", 3, 0.01);
    let results = db.nearest(&query, 10);
    assert_eq!(results.len(), 10);

    let in_cluster = results
        .iter()
        .filter(|(doc, _)| doc.id.0.starts_with("c3_"))
        .count();
    assert!(in_cluster >= 9, "only {} of 10 from cluster 3", in_cluster);

    for pair in results.windows(2) {
        assert!(pair[0].1 <= pair[1].1, "distances not sorted");
    }

    // The query fan-out stays narrow once partitions exist
    let nodes = db.nodes_for_query(&query);
    assert!(!nodes.is_empty());
    assert!(nodes.len() <= 3);

    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_ingest_routes_and_replicates() {
    let db = wired_db("n1", 3).await;
    db.node_joined(NodeId::from("n2"), "h2:1".into(), 500).await;
    db.node_joined(NodeId::from("n3"), "h3:1".into(), 500).await;

    db.build_partitions(five_cluster_corpus(20));

    let result = db.ingest(clustered_doc("fresh", 1, 0.005)).unwrap();
    assert!(result.routing.partition_id.is_some());
    assert_eq!(result.replicas.replicas.len(), 2);
    assert!(!result
        .replicas
        .replicas
        .iter()
        .any(|r| r.node_id == result.routing.primary_node));

    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_partition_tolerance_end_to_end() {
    let db = wired_db("n1", 5).await;
    for node in ["n2", "n3", "n4", "n5"] {
        db.node_joined(NodeId::from(node), format!("{}:1", node), 500).await;
    }
    assert_eq!(db.degradation().status().operation_mode, OperationMode::Normal);

    // Lose contact with three of five nodes
    let reachable = vec![NodeId::from("n1"), NodeId::from("n2")];
    let status = db.handle_partition(&reachable, 5).await;

    assert_eq!(status.operation_mode, OperationMode::Partitioned);
    let config = db.degradation().cluster_config();
    assert!(config.is_partitioned);
    assert!(!config.is_majority);

    // AP: reads and writes still succeed
    let write = db.write(DocumentId::from("k1"), json!({"v": 1}));
    assert!(write.accepted);

    let read = db.read(&DocumentId::from("k1"));
    assert!(read.success);
    assert_ne!(read.freshness, Freshness::Fresh);

    // Heal: all five reachable again
    let all: Vec<NodeId> = (1..=5).map(|i| NodeId(format!("n{}", i))).collect();
    let status = db.heal_partition(&all).await;
    assert_eq!(status.operation_mode, OperationMode::Normal);

    let read = db.read(&DocumentId::from("k1"));
    assert!(read.success);

    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_single_node_ingest_never_refused() {
    let db = wired_db("n1", 3).await;

    db.build_partitions(five_cluster_corpus(10));
    let result = db.ingest(clustered_doc("solo", 0, 0.001)).unwrap();

    // Alone in the cluster: primary only, still accepted
    assert!(result.replicas.replicas.is_empty());
    assert_eq!(result.routing.primary_node, NodeId::from("n1"));

    db.stop().await.unwrap();
}

#[tokio::test]
async fn test_node_leave_shrinks_capabilities() {
    let db = wired_db("n1", 3).await;
    db.node_joined(NodeId::from("n2"), "h2:1".into(), 500).await;
    db.node_joined(NodeId::from("n3"), "h3:1".into(), 500).await;
    assert_eq!(db.replicator().replication_factor(), 2);

    let status = db.node_left(&NodeId::from("n3"), "maintenance").await;
    assert_eq!(status.operation_mode, OperationMode::Degraded);
    assert_eq!(db.replicator().replication_factor(), 1);

    let status = db.node_left(&NodeId::from("n2"), "maintenance").await;
    assert_eq!(status.operation_mode, OperationMode::SingleNode);
    assert_eq!(db.replicator().replication_factor(), 0);

    db.stop().await.unwrap();
}
