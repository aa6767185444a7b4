//! Adaptive Maximal Marginal Relevance diversification.
//!
//! Lambda follows a sigmoid of estimated query complexity; the
//! document-repetition penalty is tempered by an EMA of document
//! distribution entropy, so workspaces that are naturally concentrated
//! in one document are penalized less.

use std::collections::{HashMap, HashSet};

use crate::intent::Intent;

use super::RetrievedChunk;

const LAMBDA_MIN: f64 = 0.2;
const LAMBDA_MAX: f64 = 0.8;
const DOC_PENALTY_BASE: f64 = 0.15;
const DOC_ENTROPY_CEILING: f64 = 1.1;
const SECTION_PENALTY: f64 = 0.1;
const EARLY_SESSIONS: u64 = 10;
const ALPHA_EARLY: f64 = 0.3;
const ALPHA_SETTLED: f64 = 0.1;

/// Per-engine EMA of document-distribution entropy.
#[derive(Debug, Clone)]
pub struct MmrState {
    avg_doc_entropy: f64,
    sessions: u64,
}

impl MmrState {
    pub fn new() -> Self {
        Self {
            avg_doc_entropy: 0.0,
            sessions: 0,
        }
    }

    pub fn avg_doc_entropy(&self) -> f64 {
        self.avg_doc_entropy
    }

    fn observe(&mut self, entropy: f64) {
        if self.sessions == 0 {
            self.avg_doc_entropy = entropy;
        } else {
            let alpha = if self.sessions < EARLY_SESSIONS {
                ALPHA_EARLY
            } else {
                ALPHA_SETTLED
            };
            self.avg_doc_entropy = (1.0 - alpha) * self.avg_doc_entropy + alpha * entropy;
        }
        self.sessions += 1;
    }
}

impl Default for MmrState {
    fn default() -> Self {
        Self::new()
    }
}

/// Sigmoid-tuned lambda from query complexity, clamped to [0.2, 0.8].
pub fn lambda(query: &str, intent: Intent) -> f64 {
    let words = query.split_whitespace().count() as f64;
    let broad_bonus = if matches!(intent, Intent::Summary | Intent::Procedure) {
        0.5
    } else {
        0.0
    };
    let complexity = words / 10.0 + broad_bonus;
    let sigmoid = 1.0 / (1.0 + (-5.0 * (complexity - 0.5)).exp());
    sigmoid.clamp(LAMBDA_MIN, LAMBDA_MAX)
}

/// Shannon entropy of the `doc_id` distribution, in bits.
pub fn doc_entropy_bits(results: &[RetrievedChunk]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for result in results {
        *counts.entry(result.doc_id.as_str()).or_insert(0) += 1;
    }
    let total = results.len() as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Greedy diversity selection over the fused candidate list.
///
/// Seeds with the top candidate, then repeatedly picks the argmax of
/// `λ·score − (1−λ)·penalty`, where penalty grows when a candidate's
/// document or heading path is already represented. Returns the
/// selection and the total penalty charged, which the caller logs.
pub fn diversify(
    state: &mut MmrState,
    candidates: &[RetrievedChunk],
    query: &str,
    intent: Intent,
    limit: usize,
) -> (Vec<RetrievedChunk>, f64) {
    if candidates.len() < 2 || limit == 0 {
        return (candidates.iter().take(limit).cloned().collect(), 0.0);
    }

    state.observe(doc_entropy_bits(candidates));
    let entropy = state.avg_doc_entropy();
    let lambda = lambda(query, intent);

    let mut selected: Vec<RetrievedChunk> = vec![candidates[0].clone()];
    let mut selected_docs: HashSet<String> = HashSet::new();
    let mut selected_paths: HashSet<String> = HashSet::new();
    selected_docs.insert(candidates[0].doc_id.clone());
    selected_paths.insert(candidates[0].heading_path.clone());

    let mut remaining: Vec<&RetrievedChunk> = candidates[1..].iter().collect();
    let mut penalty_total = 0.0;

    while selected.len() < limit && !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_mmr = f64::NEG_INFINITY;
        let mut best_penalty = 0.0;

        for (i, candidate) in remaining.iter().enumerate() {
            let mut penalty = 0.0;
            if selected_docs.contains(&candidate.doc_id) {
                penalty += DOC_PENALTY_BASE * (DOC_ENTROPY_CEILING - entropy);
            }
            if selected_paths.contains(&candidate.heading_path) {
                penalty += SECTION_PENALTY;
            }

            let mmr = lambda * candidate.score - (1.0 - lambda) * penalty;
            if mmr > best_mmr {
                best_mmr = mmr;
                best_idx = i;
                best_penalty = penalty;
            }
        }

        let picked = remaining.remove(best_idx);
        penalty_total += best_penalty;
        selected_docs.insert(picked.doc_id.clone());
        selected_paths.insert(picked.heading_path.clone());
        selected.push(picked.clone());
    }

    (selected, penalty_total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: i64, doc_id: &str, heading_path: &str, score: f64) -> RetrievedChunk {
        RetrievedChunk {
            id,
            doc_id: doc_id.to_string(),
            heading_path: heading_path.to_string(),
            score,
            ..RetrievedChunk::default()
        }
    }

    #[test]
    fn lambda_is_clamped() {
        // Single-word general query: complexity 0.1 → sigmoid(−2) ≈ 0.12.
        assert_eq!(lambda("cache", Intent::General), LAMBDA_MIN);
        // Long summary query saturates the sigmoid.
        let long = "give me a full overview of every chapter in this very long textbook please";
        assert_eq!(lambda(long, Intent::Summary), LAMBDA_MAX);
    }

    #[test]
    fn lambda_midpoint_is_half() {
        // complexity exactly 0.5 → sigmoid(0) = 0.5.
        let q = "a b c d e";
        assert!((lambda(q, Intent::General) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn entropy_of_uniform_two_docs_is_one_bit() {
        let results = vec![
            candidate(1, "a", "p1", 0.9),
            candidate(2, "b", "p2", 0.8),
        ];
        assert!((doc_entropy_bits(&results) - 1.0).abs() < 1e-12);
        assert_eq!(doc_entropy_bits(&[candidate(1, "a", "p", 0.9)]), 0.0);
    }

    #[test]
    fn entropy_ema_switches_alpha_after_ten_sessions() {
        let mut state = MmrState::new();
        state.observe(1.0);
        assert_eq!(state.avg_doc_entropy(), 1.0);

        state.observe(0.0);
        // Early alpha 0.3: 0.7 × 1.0 + 0.3 × 0.0
        assert!((state.avg_doc_entropy() - 0.7).abs() < 1e-12);

        for _ in 0..8 {
            state.observe(state.avg_doc_entropy());
        }
        let settled = state.avg_doc_entropy();
        state.observe(settled + 1.0);
        // Settled alpha 0.1.
        assert!((state.avg_doc_entropy() - (settled + 0.1)).abs() < 1e-9);
    }

    #[test]
    fn diversify_seeds_with_top_result() {
        let mut state = MmrState::new();
        let candidates = vec![
            candidate(1, "a", "p1", 0.9),
            candidate(2, "b", "p2", 0.8),
            candidate(3, "c", "p3", 0.7),
        ];
        let (selected, penalty) = diversify(&mut state, &candidates, "q", Intent::General, 2);
        assert_eq!(selected[0].id, 1);
        assert_eq!(selected.len(), 2);
        // All distinct docs and sections: nothing charged.
        assert_eq!(penalty, 0.0);
    }

    #[test]
    fn repeated_document_is_penalized_past_a_fresh_one() {
        let mut state = MmrState::new();
        // Same doc twice at the top; a slightly weaker hit from another
        // doc should win slot 2 once the repetition penalty lands.
        let candidates = vec![
            candidate(1, "a", "p1", 0.50),
            candidate(2, "a", "p1", 0.49),
            candidate(3, "b", "p2", 0.45),
        ];
        let (selected, penalty) = diversify(&mut state, &candidates, "cache", Intent::General, 2);
        assert_eq!(selected[0].id, 1);
        assert_eq!(selected[1].id, 3);
        assert_eq!(penalty, 0.0, "the picked candidate itself was unpenalized");
    }

    #[test]
    fn penalty_total_reflects_forced_repetition() {
        let mut state = MmrState::new();
        // Only one document available: the second pick must eat the
        // doc + section penalty.
        let candidates = vec![
            candidate(1, "a", "p1", 0.9),
            candidate(2, "a", "p1", 0.8),
        ];
        let (selected, penalty) = diversify(&mut state, &candidates, "q", Intent::General, 2);
        assert_eq!(selected.len(), 2);
        // Entropy of a single-doc list is 0, so the doc penalty is
        // 0.15 × 1.1, plus 0.1 for the repeated heading path.
        assert!((penalty - (0.15 * 1.1 + 0.1)).abs() < 1e-12);
    }

    #[test]
    fn single_candidate_passes_through() {
        let mut state = MmrState::new();
        let candidates = vec![candidate(1, "a", "p1", 0.9)];
        let (selected, penalty) = diversify(&mut state, &candidates, "q", Intent::General, 5);
        assert_eq!(selected.len(), 1);
        assert_eq!(penalty, 0.0);
        assert_eq!(state.sessions, 0, "degenerate lists do not move the EMA");
    }
}
