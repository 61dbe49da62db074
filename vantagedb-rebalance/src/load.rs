//! Load metrics and rebalance planning.
//!
//! Watches per-node load, summarizes the cluster-wide distribution and
//! produces migration plans: sources with excess documents are greedily
//! matched to targets with spare capacity, proportional to capacity.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use vantagedb_core::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadLevel {
    /// > 90%
    Critical,
    /// > 75%
    High,
    /// 40% - 75%
    Normal,
    /// < 40%
    Low,
    /// 0%
    Empty,
}

/// Load metrics reported for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadMetrics {
    pub node_id: NodeId,
    pub document_count: usize,
    pub capacity: usize,
    pub storage_used_bytes: u64,
    pub storage_capacity_bytes: u64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub is_healthy: bool,
    pub last_updated: DateTime<Utc>,
}

impl LoadMetrics {
    pub fn new(node_id: NodeId, capacity: usize, document_count: usize) -> Self {
        Self {
            node_id,
            document_count,
            capacity,
            storage_used_bytes: 0,
            storage_capacity_bytes: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            is_healthy: true,
            last_updated: Utc::now(),
        }
    }

    pub fn load_factor(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.document_count as f64 / self.capacity as f64
    }

    pub fn storage_factor(&self) -> f64 {
        if self.storage_capacity_bytes == 0 {
            return 0.0;
        }
        self.storage_used_bytes as f64 / self.storage_capacity_bytes as f64
    }

    /// Weighted composite of document, storage, cpu and memory load.
    pub fn combined_load(&self) -> f64 {
        0.4 * self.load_factor()
            + 0.2 * self.storage_factor()
            + 0.2 * self.cpu_usage
            + 0.2 * self.memory_usage
    }

    pub fn load_level(&self) -> LoadLevel {
        let load = self.load_factor();
        if load <= 0.0 {
            LoadLevel::Empty
        } else if load < 0.4 {
            LoadLevel::Low
        } else if load < 0.75 {
            LoadLevel::Normal
        } else if load < 0.9 {
            LoadLevel::High
        } else {
            LoadLevel::Critical
        }
    }

    pub fn available_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.document_count)
    }
}

/// One planned migration between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceDecision {
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub documents_to_move: usize,
    /// Higher is more urgent; derived from the source's load level
    pub priority: u8,
    pub reason: String,
}

/// Cluster-wide load summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterLoadSummary {
    pub total_documents: usize,
    pub total_capacity: usize,
    pub node_count: usize,
    pub healthy_nodes: usize,
    pub avg_load_factor: f64,
    pub load_variance: f64,
    pub load_std_dev: f64,
    pub min_load_factor: f64,
    pub max_load_factor: f64,
    pub imbalance_ratio: f64,
    pub overloaded_nodes: Vec<NodeId>,
    pub underloaded_nodes: Vec<NodeId>,
    pub critical_nodes: Vec<NodeId>,
}

/// Projected effect of executing a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceImpact {
    pub total_documents_moved: usize,
    pub migrations: usize,
    pub current_load_std: f64,
    pub projected_load_std: f64,
    pub improvement_ratio: f64,
}

pub struct LoadCalculator {
    imbalance_threshold: f64,
    critical_threshold: f64,
    min_transfer_size: usize,
    metrics: HashMap<NodeId, LoadMetrics>,
}

impl LoadCalculator {
    pub fn new(imbalance_threshold: f64, critical_threshold: f64, min_transfer_size: usize) -> Self {
        Self {
            imbalance_threshold,
            critical_threshold,
            min_transfer_size,
            metrics: HashMap::new(),
        }
    }

    pub fn update_node_metrics(&mut self, metrics: LoadMetrics) {
        self.metrics.insert(metrics.node_id.clone(), metrics);
    }

    pub fn register_node(&mut self, node_id: NodeId, capacity: usize, document_count: usize) {
        self.metrics.insert(
            node_id.clone(),
            LoadMetrics::new(node_id, capacity, document_count),
        );
    }

    pub fn set_document_count(&mut self, node_id: &NodeId, document_count: usize) {
        if let Some(m) = self.metrics.get_mut(node_id) {
            m.document_count = document_count;
            m.last_updated = Utc::now();
        }
    }

    pub fn set_health(&mut self, node_id: &NodeId, is_healthy: bool) {
        if let Some(m) = self.metrics.get_mut(node_id) {
            m.is_healthy = is_healthy;
        }
    }

    pub fn remove_node(&mut self, node_id: &NodeId) {
        self.metrics.remove(node_id);
    }

    pub fn node_metrics(&self, node_id: &NodeId) -> Option<&LoadMetrics> {
        self.metrics.get(node_id)
    }

    pub fn cluster_summary(&self) -> ClusterLoadSummary {
        let healthy: Vec<&LoadMetrics> =
            self.metrics.values().filter(|m| m.is_healthy).collect();
        let load_factors: Vec<f64> = if healthy.is_empty() {
            vec![0.0]
        } else {
            healthy.iter().map(|m| m.load_factor()).collect()
        };

        let avg = load_factors.iter().sum::<f64>() / load_factors.len() as f64;
        let variance = load_factors
            .iter()
            .map(|l| (l - avg) * (l - avg))
            .sum::<f64>()
            / load_factors.len() as f64;
        let std_dev = variance.sqrt();
        let min = load_factors.iter().cloned().fold(f64::MAX, f64::min);
        let max = load_factors.iter().cloned().fold(f64::MIN, f64::max);

        let sorted_ids = |mut ids: Vec<NodeId>| {
            ids.sort();
            ids
        };

        ClusterLoadSummary {
            total_documents: self.metrics.values().map(|m| m.document_count).sum(),
            total_capacity: self.metrics.values().map(|m| m.capacity).sum(),
            node_count: self.metrics.len(),
            healthy_nodes: healthy.len(),
            avg_load_factor: avg,
            load_variance: variance,
            load_std_dev: std_dev,
            min_load_factor: min,
            max_load_factor: max,
            imbalance_ratio: if avg > 0.0 { (max - min) / avg } else { 0.0 },
            overloaded_nodes: sorted_ids(
                healthy
                    .iter()
                    .filter(|m| m.load_factor() > 0.75)
                    .map(|m| m.node_id.clone())
                    .collect(),
            ),
            underloaded_nodes: sorted_ids(
                healthy
                    .iter()
                    .filter(|m| m.load_factor() < 0.4)
                    .map(|m| m.node_id.clone())
                    .collect(),
            ),
            critical_nodes: sorted_ids(
                healthy
                    .iter()
                    .filter(|m| m.load_factor() > self.critical_threshold)
                    .map(|m| m.node_id.clone())
                    .collect(),
            ),
        }
    }

    /// Whether a rebalance should run, with the reason.
    pub fn needs_rebalancing(&self) -> (bool, String) {
        let summary = self.cluster_summary();

        if summary.healthy_nodes < 2 {
            return (false, "insufficient healthy nodes".to_string());
        }
        if !summary.critical_nodes.is_empty() {
            return (
                true,
                format!("critical load on nodes: {:?}", summary.critical_nodes),
            );
        }
        if summary.load_std_dev > self.imbalance_threshold {
            return (
                true,
                format!("load imbalance (std_dev={:.3})", summary.load_std_dev),
            );
        }
        if summary.imbalance_ratio > 0.5 {
            return (
                true,
                format!("high imbalance ratio: {:.2}", summary.imbalance_ratio),
            );
        }

        (false, "cluster is balanced".to_string())
    }

    /// Target document counts proportional to capacity, capped at capacity.
    pub fn optimal_distribution(&self) -> HashMap<NodeId, usize> {
        let healthy: Vec<&LoadMetrics> =
            self.metrics.values().filter(|m| m.is_healthy).collect();
        if healthy.is_empty() {
            return HashMap::new();
        }

        let total_docs: usize = healthy.iter().map(|m| m.document_count).sum();
        let total_capacity: usize = healthy.iter().map(|m| m.capacity).sum();
        if total_capacity == 0 {
            return HashMap::new();
        }

        healthy
            .into_iter()
            .map(|m| {
                let share = m.capacity as f64 / total_capacity as f64;
                let target = (total_docs as f64 * share) as usize;
                (m.node_id.clone(), target.min(m.capacity))
            })
            .collect()
    }

    /// Greedy plan: sources (excess >= min transfer) matched against
    /// targets (deficit >= min transfer), most loaded first, moving
    /// `min(excess, deficit)` per pair.
    pub fn generate_plan(&self) -> Vec<RebalanceDecision> {
        let optimal = self.optimal_distribution();
        if optimal.is_empty() {
            return Vec::new();
        }

        let mut deltas: Vec<(NodeId, i64)> = optimal
            .iter()
            .filter_map(|(node_id, target)| {
                self.metrics
                    .get(node_id)
                    .map(|m| (node_id.clone(), m.document_count as i64 - *target as i64))
            })
            .collect();
        deltas.sort_by(|a, b| a.0.cmp(&b.0));

        let min = self.min_transfer_size as i64;
        let mut sources: Vec<(NodeId, i64)> = deltas
            .iter()
            .filter(|(_, d)| *d >= min)
            .cloned()
            .collect();
        let mut targets: Vec<(NodeId, i64)> = deltas
            .iter()
            .filter(|(_, d)| -*d >= min)
            .map(|(n, d)| (n.clone(), -d))
            .collect();

        sources.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        targets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut decisions = Vec::new();
        for (source_id, excess) in sources {
            let mut remaining = excess;

            for (target_id, deficit) in targets.iter_mut() {
                if remaining <= 0 || *deficit <= 0 {
                    continue;
                }

                let to_move = remaining.min(*deficit);
                if to_move >= min {
                    let priority = match self
                        .metrics
                        .get(&source_id)
                        .map(|m| m.load_level())
                        .unwrap_or(LoadLevel::Normal)
                    {
                        LoadLevel::Critical => 3,
                        LoadLevel::High => 2,
                        _ => 1,
                    };

                    decisions.push(RebalanceDecision {
                        source_node: source_id.clone(),
                        target_node: target_id.clone(),
                        documents_to_move: to_move as usize,
                        priority,
                        reason: format!("load balancing: {} -> {}", source_id, target_id),
                    });

                    remaining -= to_move;
                    *deficit -= to_move;
                }
            }
        }

        decisions.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!("rebalance plan: {} decisions", decisions.len());
        decisions
    }

    /// Simulate the plan and compare load spread before and after.
    pub fn estimate_impact(&self, decisions: &[RebalanceDecision]) -> RebalanceImpact {
        let mut projected: HashMap<NodeId, i64> = self
            .metrics
            .iter()
            .map(|(id, m)| (id.clone(), m.document_count as i64))
            .collect();

        for decision in decisions {
            if let Some(count) = projected.get_mut(&decision.source_node) {
                *count -= decision.documents_to_move as i64;
            }
            if let Some(count) = projected.get_mut(&decision.target_node) {
                *count += decision.documents_to_move as i64;
            }
        }

        let std_of = |counts: &HashMap<NodeId, i64>| -> f64 {
            let factors: Vec<f64> = counts
                .iter()
                .filter_map(|(id, count)| {
                    self.metrics.get(id).and_then(|m| {
                        if m.capacity > 0 {
                            Some(*count as f64 / m.capacity as f64)
                        } else {
                            None
                        }
                    })
                })
                .collect();
            if factors.is_empty() {
                return 0.0;
            }
            let avg = factors.iter().sum::<f64>() / factors.len() as f64;
            (factors.iter().map(|f| (f - avg) * (f - avg)).sum::<f64>() / factors.len() as f64)
                .sqrt()
        };

        let current: HashMap<NodeId, i64> = self
            .metrics
            .iter()
            .map(|(id, m)| (id.clone(), m.document_count as i64))
            .collect();
        let current_std = std_of(&current);
        let projected_std = std_of(&projected);

        RebalanceImpact {
            total_documents_moved: decisions.iter().map(|d| d.documents_to_move).sum(),
            migrations: decisions.len(),
            current_load_std: current_std,
            projected_load_std: projected_std,
            improvement_ratio: if current_std > 0.0 {
                (current_std - projected_std) / current_std
            } else {
                0.0
            },
        }
    }
}
