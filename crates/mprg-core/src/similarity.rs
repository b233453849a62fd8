//! Plan and assumption similarity.

use std::collections::BTreeSet;

/// Cosine similarity computed in f64. Mismatched, empty or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Lowercase, turn punctuation into spaces and collapse whitespace.
pub fn normalize_assumption(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized assumption set; blank entries are dropped.
pub fn assumption_set<S: AsRef<str>>(assumptions: &[S]) -> BTreeSet<String> {
    assumptions
        .iter()
        .map(|a| normalize_assumption(a.as_ref()))
        .filter(|a| !a.is_empty())
        .collect()
}

/// Jaccard overlap. Zero when either set is empty.
pub fn jaccard_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Both similarity signals for one pair of runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairSimilarity {
    pub plan: f64,
    pub assumptions: f64,
}

impl PairSimilarity {
    /// Linked iff either signal reaches its threshold.
    pub fn is_linked(&self, plan_threshold: f64, assumption_threshold: f64) -> bool {
        self.plan >= plan_threshold || self.assumptions >= assumption_threshold
    }

    /// Strength used for representative selection.
    pub fn strength(&self) -> f64 {
        self.plan.max(self.assumptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.3f32, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_rejects_mismatched_or_zero_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn assumptions_are_normalized_before_comparison() {
        let a = assumption_set(&["  Traffic is LOW at night. ", "Budget is fixed"]);
        let b = assumption_set(&["traffic is low   at night", "budget, is fixed!"]);
        assert_eq!(a, b);
        assert_eq!(jaccard_similarity(&a, &b), 1.0);
    }

    #[test]
    fn jaccard_partial_overlap() {
        let a = assumption_set(&["a", "b", "c"]);
        let b = assumption_set(&["b", "c", "d"]);
        assert!((jaccard_similarity(&a, &b) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn jaccard_is_zero_when_either_side_is_empty() {
        let empty = assumption_set::<&str>(&[]);
        let some = assumption_set(&["a"]);
        assert_eq!(jaccard_similarity(&empty, &empty), 0.0);
        assert_eq!(jaccard_similarity(&empty, &some), 0.0);
        // blank strings vanish during normalization
        assert!(assumption_set(&["  ", "..."]).is_empty());
    }

    #[test]
    fn pair_links_on_either_signal() {
        let plan_only = PairSimilarity {
            plan: 0.9,
            assumptions: 0.0,
        };
        let assumptions_only = PairSimilarity {
            plan: 0.1,
            assumptions: 0.75,
        };
        let neither = PairSimilarity {
            plan: 0.84,
            assumptions: 0.69,
        };
        assert!(plan_only.is_linked(0.85, 0.70));
        assert!(assumptions_only.is_linked(0.85, 0.70));
        assert!(!neither.is_linked(0.85, 0.70));
        assert_eq!(assumptions_only.strength(), 0.75);
    }
}
