//! Composite distance over document vector bundles.
//!
//! The placement metric combines three component distances:
//!
//! `d(A,B) = w_n * cosine(name) + w_c * jaccard(minhash) + w_t * jsd(topics)`
//!
//! with default weights 0.4 / 0.4 / 0.2. The result is deterministic,
//! symmetric and zero on identical bundles, but the weighted sum of
//! non-metrics does not satisfy the strict triangle inequality; the VP-tree
//! treats it as approximate accordingly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use vantagedb_core::types::{Document, VectorBundle};

const EPSILON: f64 = 1e-10;

/// Weights for the combined distance. Renormalized to sum to 1 when
/// constructed with anything else.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DistanceWeights {
    pub name_weight: f64,
    pub content_weight: f64,
    pub topic_weight: f64,
}

impl DistanceWeights {
    pub fn new(name_weight: f64, content_weight: f64, topic_weight: f64) -> Self {
        let total = name_weight + content_weight + topic_weight;
        if (total - 1.0).abs() < EPSILON || total <= 0.0 {
            Self {
                name_weight,
                content_weight,
                topic_weight,
            }
        } else {
            Self {
                name_weight: name_weight / total,
                content_weight: content_weight / total,
                topic_weight: topic_weight / total,
            }
        }
    }
}

impl Default for DistanceWeights {
    fn default() -> Self {
        Self {
            name_weight: 0.4,
            content_weight: 0.4,
            topic_weight: 0.2,
        }
    }
}

/// Calculates distances between document vector bundles.
#[derive(Debug, Clone, Default)]
pub struct DistanceCalculator {
    weights: DistanceWeights,
}

impl DistanceCalculator {
    pub fn new(weights: DistanceWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> DistanceWeights {
        self.weights
    }

    /// Cosine similarity between two sparse TF-IDF vectors, clamped to
    /// [-1, 1] against floating-point drift.
    pub fn cosine_similarity(&self, a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
        let norm_a = a.values().map(|v| v * v).sum::<f64>().sqrt();
        let norm_b = b.values().map(|v| v * v).sum::<f64>().sqrt();

        if norm_a < EPSILON || norm_b < EPSILON {
            return 0.0;
        }

        // Iterate the smaller map over the intersection
        let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        let dot: f64 = small
            .iter()
            .filter_map(|(term, wa)| large.get(term).map(|wb| wa * wb))
            .sum();

        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }

    /// Cosine distance normalized into [0, 1]. Degenerate vectors (norm
    /// below epsilon) are at distance 0.
    pub fn cosine_distance(&self, a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
        let norm_a = a.values().map(|v| v * v).sum::<f64>().sqrt();
        let norm_b = b.values().map(|v| v * v).sum::<f64>().sqrt();
        if norm_a < EPSILON || norm_b < EPSILON {
            return 0.0;
        }
        (1.0 - self.cosine_similarity(a, b)) / 2.0
    }

    /// Jaccard similarity estimated from MinHash signatures: the fraction
    /// of positions with equal hash values. Signatures of unequal length
    /// are truncated to the shorter one.
    pub fn jaccard_similarity(&self, a: &[u64], b: &[u64]) -> f64 {
        let len = a.len().min(b.len());
        if len == 0 {
            return 0.0;
        }
        let matches = a.iter().zip(b.iter()).take(len).filter(|(x, y)| x == y).count();
        matches as f64 / len as f64
    }

    pub fn jaccard_distance(&self, a: &[u64], b: &[u64]) -> f64 {
        1.0 - self.jaccard_similarity(a, b)
    }

    /// Jensen-Shannon divergence between two topic distributions, using
    /// base-2 logarithms so the result is bounded by [0, 1].
    ///
    /// Distributions of unequal length are zero-padded to the longer one;
    /// both are smoothed and renormalized before the KL terms. A
    /// distribution summing below epsilon yields maximum divergence.
    pub fn jensen_shannon_divergence(&self, a: &[f64], b: &[f64]) -> f64 {
        let len = a.len().max(b.len());
        if len == 0 {
            return 1.0;
        }

        let sum_a: f64 = a.iter().sum();
        let sum_b: f64 = b.iter().sum();
        if sum_a < EPSILON || sum_b < EPSILON {
            return 1.0;
        }

        let pad = |v: &[f64], sum: f64| -> Vec<f64> {
            let mut out: Vec<f64> = (0..len)
                .map(|i| v.get(i).copied().unwrap_or(0.0) / sum + EPSILON)
                .collect();
            let total: f64 = out.iter().sum();
            for x in out.iter_mut() {
                *x /= total;
            }
            out
        };

        let p = pad(a, sum_a);
        let q = pad(b, sum_b);

        let mut kl_pm = 0.0;
        let mut kl_qm = 0.0;
        for i in 0..len {
            let m = 0.5 * (p[i] + q[i]);
            kl_pm += p[i] * (p[i] / m).log2();
            kl_qm += q[i] * (q[i] / m).log2();
        }

        (0.5 * kl_pm + 0.5 * kl_qm).clamp(0.0, 1.0)
    }

    /// Combined weighted distance between two vector bundles.
    ///
    /// A component missing from either bundle contributes its maximum
    /// distance of 1.
    pub fn weighted_distance(&self, a: &VectorBundle, b: &VectorBundle) -> f64 {
        let name_dist = match (&a.name_vector, &b.name_vector) {
            (Some(va), Some(vb)) => self.cosine_distance(va, vb),
            _ => 1.0,
        };

        let content_dist = match (&a.minhash_signature, &b.minhash_signature) {
            (Some(sa), Some(sb)) => self.jaccard_distance(sa, sb),
            _ => 1.0,
        };

        let topic_dist = match (&a.topic_distribution, &b.topic_distribution) {
            (Some(ta), Some(tb)) => self.jensen_shannon_divergence(ta, tb),
            _ => 1.0,
        };

        let combined = self.weights.name_weight * name_dist
            + self.weights.content_weight * content_dist
            + self.weights.topic_weight * topic_dist;

        combined.clamp(0.0, 1.0)
    }

    /// Distance between two documents.
    pub fn document_distance(&self, a: &Document, b: &Document) -> f64 {
        self.weighted_distance(&a.vectors, &b.vectors)
    }

    /// Distances from one query to many documents, in input order.
    pub fn batch_distances(&self, query: &Document, documents: &[Document]) -> Vec<f64> {
        documents
            .iter()
            .map(|doc| self.document_distance(query, doc))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bundle(name: &[(&str, f64)], sig: &[u64], topics: &[f64]) -> VectorBundle {
        VectorBundle {
            name_vector: Some(name.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
            minhash_signature: Some(sig.to_vec()),
            topic_distribution: Some(topics.to_vec()),
        }
    }

    #[test]
    fn test_identical_bundles_distance_zero() {
        let calc = DistanceCalculator::default();
        let a = bundle(&[("alpha", 1.0), ("beta", 0.5)], &[1, 2, 3, 4], &[0.5, 0.3, 0.2]);
        assert!(calc.weighted_distance(&a, &a) < 1e-9);
    }

    #[test]
    fn test_missing_components_are_maximal() {
        let calc = DistanceCalculator::default();
        let full = bundle(&[("alpha", 1.0)], &[1, 2], &[1.0]);
        let empty = VectorBundle::default();
        assert!((calc.weighted_distance(&full, &empty) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_orthogonal_vectors() {
        let calc = DistanceCalculator::default();
        let a: HashMap<String, f64> = [("x".to_string(), 1.0)].into_iter().collect();
        let b: HashMap<String, f64> = [("y".to_string(), 1.0)].into_iter().collect();
        assert!((calc.cosine_similarity(&a, &b)).abs() < 1e-9);
        assert!((calc.cosine_distance(&a, &b) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_zero_norm_is_zero_distance() {
        let calc = DistanceCalculator::default();
        let zero: HashMap<String, f64> = HashMap::new();
        let a: HashMap<String, f64> = [("x".to_string(), 1.0)].into_iter().collect();
        assert_eq!(calc.cosine_distance(&zero, &a), 0.0);
    }

    #[test]
    fn test_jaccard_truncates_to_shorter() {
        let calc = DistanceCalculator::default();
        let a = vec![1, 2, 3, 4];
        let b = vec![1, 2, 9];
        // Matches in 2 of 3 compared positions
        assert!((calc.jaccard_similarity(&a, &b) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_jsd_disjoint_distributions() {
        let calc = DistanceCalculator::default();
        let p = vec![1.0, 0.0];
        let q = vec![0.0, 1.0];
        let jsd = calc.jensen_shannon_divergence(&p, &q);
        assert!(jsd > 0.99 && jsd <= 1.0);
    }

    #[test]
    fn test_jsd_empty_distribution_is_maximal() {
        let calc = DistanceCalculator::default();
        assert_eq!(calc.jensen_shannon_divergence(&[], &[0.5, 0.5]), 1.0);
        assert_eq!(calc.jensen_shannon_divergence(&[0.0, 0.0], &[0.5, 0.5]), 1.0);
    }

    #[test]
    fn test_jsd_pads_unequal_lengths() {
        let calc = DistanceCalculator::default();
        let jsd = calc.jensen_shannon_divergence(&[0.5, 0.5], &[0.5, 0.3, 0.2]);
        assert!(jsd >= 0.0 && jsd <= 1.0);
    }

    #[test]
    fn test_weights_renormalize() {
        let w = DistanceWeights::new(2.0, 2.0, 1.0);
        assert!((w.name_weight - 0.4).abs() < 1e-9);
        assert!((w.content_weight - 0.4).abs() < 1e-9);
        assert!((w.topic_weight - 0.2).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_distance_bounded_and_symmetric(
            terms_a in proptest::collection::hash_map("[a-d]", 0.0f64..10.0, 0..6),
            terms_b in proptest::collection::hash_map("[a-d]", 0.0f64..10.0, 0..6),
            sig_a in proptest::collection::vec(0u64..8, 8),
            sig_b in proptest::collection::vec(0u64..8, 8),
            topics_a in proptest::collection::vec(0.01f64..1.0, 4),
            topics_b in proptest::collection::vec(0.01f64..1.0, 4),
        ) {
            let calc = DistanceCalculator::default();
            let a = VectorBundle {
                name_vector: Some(terms_a),
                minhash_signature: Some(sig_a),
                topic_distribution: Some(topics_a),
            };
            let b = VectorBundle {
                name_vector: Some(terms_b),
                minhash_signature: Some(sig_b),
                topic_distribution: Some(topics_b),
            };

            let d_ab = calc.weighted_distance(&a, &b);
            let d_ba = calc.weighted_distance(&b, &a);

            prop_assert!(d_ab >= 0.0 && d_ab <= 1.0);
            prop_assert!((d_ab - d_ba).abs() < 1e-9);
        }

        #[test]
        fn prop_self_distance_zero(
            terms in proptest::collection::hash_map("[a-d]", 0.1f64..10.0, 1..6),
            sig in proptest::collection::vec(0u64..1000, 8),
            topics in proptest::collection::vec(0.01f64..1.0, 4),
        ) {
            let calc = DistanceCalculator::default();
            let a = VectorBundle {
                name_vector: Some(terms),
                minhash_signature: Some(sig),
                topic_distribution: Some(topics),
            };
            prop_assert!(calc.weighted_distance(&a, &a) < 1e-9);
        }
    }
}
