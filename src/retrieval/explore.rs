//! Exploration probe: a deliberately uncertain candidate surfaced at
//! rank 2 to acquire feedback. Clicks on probes are quarantined from
//! the boost signal by the feedback pathway.

use crate::intent::Intent;
use crate::store::ScoredChunk;

use super::RetrievedChunk;

const MIN_STABILITY: f64 = 0.6;
const MAX_TRUST: f64 = 1.0;
const MIN_COSINE: f64 = 0.65;
const SCORE_DISCOUNT: f64 = 0.95;

/// Probes only run for stable, low-stakes queries.
pub fn eligible(
    enabled: bool,
    stability: f64,
    intent: Intent,
    results: &[RetrievedChunk],
) -> bool {
    enabled
        && stability >= MIN_STABILITY
        && !matches!(intent, Intent::Definition | Intent::Procedure)
        && !results.is_empty()
}

/// First dense candidate past the page boundary that was never clicked
/// (trust ≤ 1.0) yet still scores a credible cosine, and is not
/// already in the final list. Returns its 1-indexed dense rank.
pub fn select_probe<'a>(
    dense: &'a [ScoredChunk],
    limit: usize,
    results: &[RetrievedChunk],
) -> Option<(i64, &'a ScoredChunk)> {
    dense
        .iter()
        .enumerate()
        .skip(limit)
        .find(|(_, hit)| {
            hit.trust_score <= MAX_TRUST
                && hit.score > MIN_COSINE
                && !results.iter().any(|r| r.id == hit.chunk.id)
        })
        .map(|(i, hit)| (i as i64 + 1, hit))
}

/// Inserts the probe at rank 2 with a score just under the top result,
/// displacing everything after it; the list keeps its size.
pub fn insert_probe(
    results: &mut Vec<RetrievedChunk>,
    probe: &ScoredChunk,
    dense_rank: i64,
    limit: usize,
) {
    let mut entry = RetrievedChunk::from_scored(probe);
    entry.semantic_rank = dense_rank;
    entry.score = results
        .first()
        .map(|top| top.score * SCORE_DISCOUNT)
        .unwrap_or(probe.score);
    entry.is_exploration = true;
    entry.stability = results.first().map(|top| top.stability).unwrap_or(1.0);

    let at = 1.min(results.len());
    results.insert(at, entry);
    results.truncate(limit.max(1));
}
