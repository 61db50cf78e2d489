//! Min-max score fusion for combining dense and sparse results.

use std::collections::BTreeMap;

use rag_core::{ChunkId, FusionWeights, Metadata, RankedChunk, ScoredChunk};

/// Min-max normalize scores into `[0, 1]`.
///
/// A single score, or a list where every score is equal, normalizes to 1.0.
pub fn normalize(scores: &[f32]) -> Vec<f32> {
    let (min, max) = scores
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), s| (lo.min(*s), hi.max(*s)));
    let range = max - min;
    scores
        .iter()
        .map(|s| if range > 0.0 { (s - min) / range } else { 1.0 })
        .collect()
}

#[derive(Default)]
struct Candidate {
    text: String,
    metadata: Metadata,
    dense: Option<f32>,
    sparse: Option<f32>,
}

/// Fuse dense and sparse candidates into one ranking.
///
/// Each list is normalized on its own, then
/// `score = w_dense * dense + w_sparse * sparse`, with a missing score
/// counting as 0. A list with weight 0 contributes no candidates. Results are
/// sorted by descending score, ties by ascending chunk id, and truncated to
/// `top_k`.
pub fn fuse(
    dense: &[ScoredChunk],
    sparse: &[ScoredChunk],
    weights: FusionWeights,
    top_k: usize,
) -> Vec<RankedChunk> {
    let mut candidates: BTreeMap<ChunkId, Candidate> = BTreeMap::new();

    if weights.dense > 0.0 {
        let scores: Vec<f32> = dense.iter().map(|c| c.score).collect();
        for (hit, norm) in dense.iter().zip(normalize(&scores)) {
            let candidate = candidates.entry(hit.chunk_id.clone()).or_insert_with(|| Candidate {
                text: hit.text.clone(),
                metadata: hit.metadata.clone(),
                ..Candidate::default()
            });
            candidate.dense = Some(norm);
        }
    }

    if weights.sparse > 0.0 {
        let scores: Vec<f32> = sparse.iter().map(|c| c.score).collect();
        for (hit, norm) in sparse.iter().zip(normalize(&scores)) {
            let candidate = candidates.entry(hit.chunk_id.clone()).or_insert_with(|| Candidate {
                text: hit.text.clone(),
                metadata: hit.metadata.clone(),
                ..Candidate::default()
            });
            candidate.sparse = Some(norm);
        }
    }

    let mut fused: Vec<RankedChunk> = candidates
        .into_iter()
        .map(|(chunk_id, c)| RankedChunk {
            score: weights.dense * c.dense.unwrap_or(0.0) + weights.sparse * c.sparse.unwrap_or(0.0),
            chunk_id,
            text: c.text,
            metadata: Some(c.metadata),
            dense_score: c.dense,
            sparse_score: c.sparse,
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused.truncate(top_k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk_id: ChunkId::from_raw(id),
            score,
            text: id.to_string(),
            metadata: Metadata::new(),
        }
    }

    fn ids(ranked: &[RankedChunk]) -> Vec<&str> {
        ranked.iter().map(|r| r.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(&[2.0, 4.0, 3.0]), vec![0.0, 1.0, 0.5]);
        assert_eq!(normalize(&[0.3]), vec![1.0]);
        assert_eq!(normalize(&[0.7, 0.7]), vec![1.0, 1.0]);
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn test_fuse_combines_both_lists() {
        let dense = vec![hit("a:0", 1.0), hit("b:0", 0.5), hit("c:0", 0.0)];
        let sparse = vec![hit("b:0", 8.0), hit("d:0", 2.0)];
        let fused = fuse(&dense, &sparse, FusionWeights::default(), 10);

        // b: 0.5 * 0.5 + 0.5 * 1.0, a: 0.5 * 1.0
        assert_eq!(ids(&fused), vec!["b:0", "a:0", "c:0", "d:0"]);
        assert!((fused[0].score - 0.75).abs() < 1e-6);
        assert_eq!(fused[0].dense_score, Some(0.5));
        assert_eq!(fused[0].sparse_score, Some(1.0));
        assert_eq!(fused[3].dense_score, None);
        assert_eq!(fused[2].score, 0.0);
    }

    #[test]
    fn test_zero_weight_list_is_ignored() {
        let dense = vec![hit("a:0", 0.9), hit("b:0", 0.4)];
        let sparse = vec![hit("z:0", 5.0)];
        let fused = fuse(&dense, &sparse, FusionWeights::new(1.0, 0.0), 10);
        assert_eq!(ids(&fused), vec!["a:0", "b:0"]);
    }

    #[test]
    fn test_ties_break_by_chunk_id() {
        let dense = vec![hit("b:0", 0.5), hit("a:0", 0.5)];
        let sparse = vec![hit("c:0", 1.0)];
        let fused = fuse(&dense, &sparse, FusionWeights::default(), 10);
        assert_eq!(ids(&fused), vec!["a:0", "b:0", "c:0"]);
    }

    #[test]
    fn test_truncates_to_top_k() {
        let dense = vec![hit("a:0", 0.9), hit("b:0", 0.8), hit("c:0", 0.7)];
        let fused = fuse(&dense, &[], FusionWeights::default(), 2);
        assert_eq!(ids(&fused), vec!["a:0", "b:0"]);
    }
}
