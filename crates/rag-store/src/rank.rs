//! Ordering shared by the nearest-neighbour scans.

use rag_core::ScoredChunk;

/// Sort hits by descending score, ties by ascending chunk id, and keep `top_n`.
pub(crate) fn rank(mut hits: Vec<ScoredChunk>, top_n: usize) -> Vec<ScoredChunk> {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(top_n);
    hits
}
