//! Nearest-neighbour matching of a query descriptor against enrolled identities.

use crate::types::{Embedding, Identity, MatchResult};

/// Default acceptance threshold on Euclidean distance.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a query embedding against a candidate set.
pub trait Matcher {
    fn compare(&self, query: &Embedding, candidates: &[Identity], threshold: f32)
        -> Option<MatchResult>;
}

/// Exhaustive Euclidean matcher.
///
/// Visits every candidate (O(n·d)). The minimum is tracked with a strict `<`,
/// so on an exact distance tie the candidate seen first wins. Candidates whose
/// embedding length differs from the query are at infinite distance and can
/// never be accepted.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &Embedding,
        candidates: &[Identity],
        threshold: f32,
    ) -> Option<MatchResult> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return None;
        }

        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, candidate) in candidates.iter().enumerate() {
            let distance = query.euclidean_distance(&candidate.embedding);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        let idx = best_idx?;
        if best_distance >= threshold {
            tracing::trace!(distance = best_distance, threshold, "nearest candidate outside threshold");
            return None;
        }

        let winner = &candidates[idx];
        Some(MatchResult {
            student_id: winner.student_id.clone(),
            name: winner.name.clone(),
            distance: best_distance,
            confidence: 1.0 - best_distance / threshold,
        })
    }
}
