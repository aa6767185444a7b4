//! Rank-stability regulator driven by the retrieval log.

use anyhow::Result;
use rusqlite::Connection;

use crate::intent::Intent;
use crate::store;

use super::RetrievedChunk;

/// How many recent non-exploration log rows feed the score.
pub const HISTORY_WINDOW: usize = 10;

const BIAS_SCALE: f64 = 0.1;

/// `max(0, 1 − avgDelta/5)` over the most recent non-exploration
/// history for the exact query. Absent history (including NULL
/// `rank_delta` from pre-migration rows) means a fresh query and full
/// stability.
pub fn stability_score(conn: &Connection, query: &str) -> Result<f64> {
    let deltas = store::recent_rank_deltas(conn, query, HISTORY_WINDOW)?;
    let observed: Vec<f64> = deltas
        .into_iter()
        .flatten()
        .map(|d| (d as f64).abs())
        .collect();

    if observed.is_empty() {
        return Ok(1.0);
    }
    let avg = observed.iter().sum::<f64>() / observed.len() as f64;
    Ok((1.0 - avg / 5.0).max(0.0))
}

/// High-trust intents lean harder on established rankings.
pub fn intent_trust_factor(intent: Intent) -> f64 {
    match intent {
        Intent::Definition => 2.0,
        Intent::Procedure => 1.5,
        Intent::Summary => 1.0,
        Intent::General | Intent::Example => 0.5,
    }
}

/// Adds the stability bias to every candidate's fused score and
/// resorts.
pub fn apply_bias(results: &mut [RetrievedChunk], stability: f64, intent: Intent) {
    let bias = BIAS_SCALE * stability * intent_trust_factor(intent);
    for result in results.iter_mut() {
        result.score += bias;
        result.stability = stability;
    }
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
}
