//! Reciprocal-rank fusion with intent-aware weighting and structural
//! boosts.

use std::collections::HashMap;

use crate::intent::Intent;
use crate::store::ScoredChunk;

use super::RetrievedChunk;

pub const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    pub semantic: f64,
    pub keyword: f64,
}

pub fn intent_weights(intent: Intent) -> FusionWeights {
    match intent {
        Intent::Definition | Intent::Procedure => FusionWeights {
            semantic: 0.35,
            keyword: 0.65,
        },
        Intent::Summary => FusionWeights {
            semantic: 0.7,
            keyword: 0.3,
        },
        Intent::General | Intent::Example => FusionWeights {
            semantic: 0.5,
            keyword: 0.5,
        },
    }
}

/// Candidate-pool multiplier over the caller's result limit.
pub fn retrieval_multiplier(intent: Intent) -> usize {
    match intent {
        Intent::Definition | Intent::Procedure => 3,
        Intent::Summary => 6,
        Intent::General | Intent::Example => 4,
    }
}

fn dense_intent_boost(intent: Intent, chunk_type: &str, heading_level: i64) -> f64 {
    let mut boost = match (intent, chunk_type) {
        (Intent::Definition, "definition") => 0.5,
        (Intent::Summary, "summary") => 0.5,
        (Intent::Procedure, "list") => 0.3,
        (Intent::Example, "example") => 0.4,
        _ => 0.0,
    };

    // Broad queries favor chapter-level nodes; specific ones favor
    // deeper nodes.
    if intent == Intent::Summary && heading_level == 1 {
        boost += 0.2;
    }
    if intent == Intent::Definition && heading_level > 1 {
        boost += 0.1;
    }
    boost
}

fn keyword_intent_boost(intent: Intent, chunk_type: &str) -> f64 {
    match (intent, chunk_type) {
        (Intent::Definition, "definition") => 0.3,
        (Intent::Summary, "summary") => 0.3,
        _ => 0.0,
    }
}

/// Fuses the dense and sparse candidate lists. Output order is fused
/// score descending, stable on ties by insertion order (dense list
/// first, then keyword-only hits).
pub fn fuse(dense: &[ScoredChunk], sparse: &[ScoredChunk], intent: Intent) -> Vec<RetrievedChunk> {
    let weights = intent_weights(intent);

    let mut out: Vec<RetrievedChunk> = Vec::with_capacity(dense.len() + sparse.len());
    let mut index_by_id: HashMap<i64, usize> = HashMap::new();

    for (i, hit) in dense.iter().enumerate() {
        let rank = (i + 1) as f64;
        let mut entry = RetrievedChunk::from_scored(hit);
        entry.semantic_rank = i as i64 + 1;
        entry.score = weights.semantic / (RRF_K + rank)
            + dense_intent_boost(intent, &hit.chunk.chunk_type, hit.chunk.heading_level);
        index_by_id.insert(hit.chunk.id, out.len());
        out.push(entry);
    }

    for (i, hit) in sparse.iter().enumerate() {
        let rank = (i + 1) as f64;
        let keyword_score = weights.keyword / (RRF_K + rank)
            + keyword_intent_boost(intent, &hit.chunk.chunk_type);

        match index_by_id.get(&hit.chunk.id) {
            Some(&pos) => {
                out[pos].keyword_rank = i as i64 + 1;
                out[pos].score += keyword_score;
            }
            None => {
                let mut entry = RetrievedChunk::from_scored(hit);
                entry.keyword_rank = i as i64 + 1;
                entry.score = keyword_score;
                index_by_id.insert(hit.chunk.id, out.len());
                out.push(entry);
            }
        }
    }

    // sort_by is stable, so equal scores keep insertion order.
    out.sort_by(|a, b| b.score.total_cmp(&a.score));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChunkRecord;

    fn scored(id: i64, chunk_type: &str, heading_level: i64) -> ScoredChunk {
        ScoredChunk {
            chunk: ChunkRecord {
                id,
                source_file: "f.pdf".to_string(),
                text: format!("chunk {id}"),
                doc_id: "d".to_string(),
                page_num: 1,
                chunk_idx: id,
                model_sig: String::new(),
                model_dim: 2,
                heading_path: format!("H{id}"),
                heading_level,
                chunk_type: chunk_type.to_string(),
                sentence_count: 1,
                list_type: None,
                list_length: 0,
                created_at: 0,
                boost_factor: 1.0,
            },
            score: 0.9,
            trust_score: 1.0,
        }
    }

    #[test]
    fn weight_table_matches_intents() {
        let w = intent_weights(Intent::Definition);
        assert_eq!((w.semantic, w.keyword), (0.35, 0.65));
        let w = intent_weights(Intent::Summary);
        assert_eq!((w.semantic, w.keyword), (0.7, 0.3));
        let w = intent_weights(Intent::General);
        assert_eq!((w.semantic, w.keyword), (0.5, 0.5));

        assert_eq!(retrieval_multiplier(Intent::Procedure), 3);
        assert_eq!(retrieval_multiplier(Intent::Summary), 6);
        assert_eq!(retrieval_multiplier(Intent::Example), 4);
        // Summary broadens the candidate pool: limit 5 pulls 30.
        assert_eq!(5 * retrieval_multiplier(Intent::Summary), 30);
    }

    #[test]
    fn rrf_is_monotone_in_dense_rank() {
        // Same chunk at a better dense rank, sparse rank held fixed,
        // never scores lower.
        let sparse = vec![scored(1, "text", 0)];

        let better = fuse(&[scored(1, "text", 0), scored(2, "text", 0)], &sparse, Intent::General);
        let worse = fuse(&[scored(2, "text", 0), scored(1, "text", 0)], &sparse, Intent::General);

        let score_at = |list: &[RetrievedChunk]| {
            list.iter().find(|r| r.id == 1).map(|r| r.score).unwrap_or(0.0)
        };
        assert!(score_at(&better) > score_at(&worse));
    }

    #[test]
    fn both_lists_beat_single_list() {
        let dense = vec![scored(1, "text", 0), scored(2, "text", 0)];
        let sparse = vec![scored(2, "text", 0)];
        let fused = fuse(&dense, &sparse, Intent::General);
        // Chunk 2 appears in both lists and overtakes chunk 1.
        assert_eq!(fused[0].id, 2);
        assert_eq!(fused[0].semantic_rank, 2);
        assert_eq!(fused[0].keyword_rank, 1);
    }

    #[test]
    fn definition_intent_boosts_definition_chunks() {
        // Dense ranks: [text B, definition A]; sparse ranks: [A, B].
        let dense = vec![scored(2, "text", 2), scored(1, "definition", 2)];
        let sparse = vec![scored(1, "definition", 2), scored(2, "text", 2)];

        let fused = fuse(&dense, &sparse, Intent::Definition);
        assert_eq!(fused[0].id, 1, "type + hierarchy boosts must lift A to the top");
    }

    #[test]
    fn summary_intent_favors_chapter_level() {
        let dense = vec![scored(1, "text", 3), scored(2, "text", 1)];
        let fused = fuse(&dense, &[], Intent::Summary);
        assert_eq!(fused[0].id, 2, "heading level 1 gets the +0.2 hierarchy boost");
    }

    #[test]
    fn ties_keep_insertion_order() {
        // Keyword-only hits at the same rank-position score identically
        // across fusions; within one fusion, order of equal scores
        // follows the input lists.
        let dense: Vec<ScoredChunk> = Vec::new();
        let sparse = vec![scored(5, "text", 0), scored(6, "text", 0)];
        let fused = fuse(&dense, &sparse, Intent::General);
        assert_eq!(fused[0].id, 5);
        assert_eq!(fused[1].id, 6);
    }

    #[test]
    fn keyword_only_entries_carry_no_semantic_rank() {
        let fused = fuse(&[], &[scored(9, "text", 0)], Intent::General);
        assert_eq!(fused[0].semantic_rank, 0);
        assert_eq!(fused[0].keyword_rank, 1);
    }
}
