//! Score fusion for hybrid retrieval
//!
//! Pure functions over candidate sets; the engine decides when to call
//! them. Weighted fusion normalizes each source against its own best score
//! before mixing, so a cosine scale (0–1) and a lexical rank scale never
//! bias the blend.

use std::collections::HashMap;

use super::RetrievalChunk;
use crate::storage::{RetrievalSettings, SegmentId, WeightConfig};

/// Oversampling factor for each hybrid sub-search.
pub const CANDIDATE_MULTIPLIER: usize = 2;

/// Floor on the candidate set each sub-search requests.
pub const MIN_CANDIDATES: usize = 10;

/// How many candidates each hybrid sub-search should fetch for a `top_k`.
pub fn candidate_limit(top_k: usize) -> usize {
    (top_k * CANDIDATE_MULTIPLIER).max(MIN_CANDIDATES)
}

/// Sort chunks by score, highest first.
pub fn sort_by_score(chunks: &mut [RetrievalChunk]) {
    chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

/// Drop chunks below the configured threshold, when the threshold is on.
pub fn apply_threshold(
    mut chunks: Vec<RetrievalChunk>,
    settings: &RetrievalSettings,
) -> Vec<RetrievalChunk> {
    if settings.score_threshold_enabled {
        chunks.retain(|c| c.score >= settings.score_threshold);
    }
    chunks
}

/// Weighted-score fusion of the vector and lexical candidate sets.
///
/// Each source's scores are first normalized by that source's own maximum.
/// Candidates merge as a union keyed by segment id: a chunk found by only
/// one source keeps a zero contribution from the other. The combined score
/// is `semantic_weight × norm_vector + keyword_weight × norm_text` with the
/// weights re-normalized to sum to 1.
pub fn fuse_weighted(
    vector: Vec<RetrievalChunk>,
    text: Vec<RetrievalChunk>,
    weights: &WeightConfig,
    top_k: usize,
) -> Vec<RetrievalChunk> {
    let (semantic_weight, keyword_weight) = weights.normalized();

    let vector_max = max_score(&vector);
    let text_max = max_score(&text);

    struct Contribution {
        chunk: RetrievalChunk,
        semantic: f32,
        keyword: f32,
    }

    let mut merged: HashMap<SegmentId, Contribution> = HashMap::new();
    for chunk in vector {
        let semantic = normalize(chunk.score, vector_max);
        merged
            .entry(chunk.id)
            .or_insert(Contribution {
                chunk,
                semantic: 0.0,
                keyword: 0.0,
            })
            .semantic = semantic;
    }
    for chunk in text {
        let keyword = normalize(chunk.score, text_max);
        merged
            .entry(chunk.id)
            .or_insert(Contribution {
                chunk,
                semantic: 0.0,
                keyword: 0.0,
            })
            .keyword = keyword;
    }

    let mut fused: Vec<RetrievalChunk> = merged
        .into_values()
        .map(|c| {
            let mut chunk = c.chunk;
            chunk.score = semantic_weight * c.semantic + keyword_weight * c.keyword;
            chunk
        })
        .collect();
    sort_by_score(&mut fused);
    fused.truncate(top_k);
    fused
}

/// Union of both candidate sets keyed by segment id, keeping the higher
/// score on duplicates. Input order is not preserved; callers sort.
pub fn merge_max(vector: Vec<RetrievalChunk>, text: Vec<RetrievalChunk>) -> Vec<RetrievalChunk> {
    let mut merged: HashMap<SegmentId, RetrievalChunk> = HashMap::new();
    for chunk in vector.into_iter().chain(text) {
        match merged.entry(chunk.id) {
            std::collections::hash_map::Entry::Occupied(mut existing) => {
                if chunk.score > existing.get().score {
                    existing.insert(chunk);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(chunk);
            }
        }
    }
    merged.into_values().collect()
}

fn max_score(chunks: &[RetrievalChunk]) -> f32 {
    chunks.iter().map(|c| c.score).fold(0.0_f32, f32::max)
}

fn normalize(score: f32, max: f32) -> f32 {
    if max > 0.0 { score / max } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: SegmentId, score: f32) -> RetrievalChunk {
        RetrievalChunk {
            id,
            document_id: "doc-1".to_string(),
            content: format!("chunk {id}"),
            score,
            metadata: None,
            chunk_index: id as usize,
            content_length: 8,
            source_name: "a.md".to_string(),
        }
    }

    #[test]
    fn candidate_limit_has_a_floor() {
        assert_eq!(candidate_limit(3), 10);
        assert_eq!(candidate_limit(5), 10);
        assert_eq!(candidate_limit(6), 12);
        assert_eq!(candidate_limit(50), 100);
    }

    #[test]
    fn union_keeps_single_source_chunks_with_one_term() {
        // Chunk 1 is found by both sources; chunk 2 only by vector search.
        let vector = vec![chunk(1, 0.8), chunk(2, 0.4)];
        let text = vec![chunk(1, 0.35)];
        let weights = WeightConfig {
            semantic_weight: 0.6,
            keyword_weight: 0.4,
        };

        let fused = fuse_weighted(vector, text, &weights, 10);
        assert_eq!(fused.len(), 2);

        let by_id = |id: SegmentId| fused.iter().find(|c| c.id == id).unwrap().score;
        // Chunk 1: both terms at their source maxima.
        assert!((by_id(1) - (0.6 * 1.0 + 0.4 * 1.0)).abs() < 1e-6);
        // Chunk 2: semantic term only, keyword contribution is zero.
        assert!((by_id(2) - 0.6 * (0.4 / 0.8)).abs() < 1e-6);
    }

    #[test]
    fn weights_are_renormalized_before_mixing() {
        let vector = vec![chunk(1, 1.0)];
        let text = vec![chunk(2, 1.0)];
        let weights = WeightConfig {
            semantic_weight: 0.6,
            keyword_weight: 0.6,
        };

        let fused = fuse_weighted(vector, text, &weights, 10);
        // 0.6/0.6 behaves exactly like 0.5/0.5.
        assert!(fused.iter().all(|c| (c.score - 0.5).abs() < 1e-6));
    }

    #[test]
    fn fusion_sorts_and_truncates() {
        let vector = vec![chunk(1, 0.2), chunk(2, 1.0), chunk(3, 0.6)];
        let fused = fuse_weighted(vector, Vec::new(), &WeightConfig::default(), 2);
        assert_eq!(fused.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn merge_max_keeps_the_higher_score() {
        let vector = vec![chunk(1, 0.9), chunk(2, 0.5)];
        let text = vec![chunk(1, 0.3), chunk(3, 0.7)];

        let mut merged = merge_max(vector, text);
        sort_by_score(&mut merged);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id, 1);
        assert!((merged[0].score - 0.9).abs() < 1e-6);
        assert_eq!(merged[1].id, 3);
        assert_eq!(merged[2].id, 2);
    }

    #[test]
    fn threshold_only_applies_when_enabled() {
        let chunks = vec![chunk(1, 0.9), chunk(2, 0.1)];

        let passthrough = apply_threshold(chunks.clone(), &RetrievalSettings::default());
        assert_eq!(passthrough.len(), 2);

        let mut settings = RetrievalSettings::default();
        settings.score_threshold = 0.5;
        settings.score_threshold_enabled = true;
        let filtered = apply_threshold(chunks, &settings);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, 1);
    }
}
