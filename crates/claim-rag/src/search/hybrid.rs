use std::collections::HashMap;

use crate::types::{CandidateSource, FusedCandidate, RetrievalCandidate};

/// Merge dense and sparse candidates into one deduplicated pool.
///
/// Order is round-robin by rank (dense[0], sparse[0], dense[1], sparse[1], ...), preserving
/// each path's internal order. A chunk returned by both paths appears once, at its first
/// position, tagged [`CandidateSource::Both`] with the better of its two ranks. Scores are
/// never combined: BM25 and cosine values live on different scales.
pub fn interleave_fusion(
    dense: Vec<RetrievalCandidate>,
    sparse: Vec<RetrievalCandidate>,
    pool_size: usize,
) -> Vec<FusedCandidate> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<FusedCandidate> = Vec::with_capacity(pool_size.min(dense.len() + sparse.len()));

    let max_len = dense.len().max(sparse.len());
    let mut dense = dense.into_iter();
    let mut sparse = sparse.into_iter();

    for rank in 0..max_len {
        for candidate in [dense.next(), sparse.next()].into_iter().flatten() {
            match positions.get(&candidate.chunk.id).copied() {
                Some(pos) => {
                    let existing = &mut merged[pos];
                    if existing.source != candidate.source {
                        existing.source = CandidateSource::Both;
                    }
                    existing.best_rank = existing.best_rank.min(rank);
                }
                // Keep scanning once full so late duplicates still get tagged `Both`.
                None if merged.len() < pool_size => {
                    positions.insert(candidate.chunk.id.clone(), merged.len());
                    merged.push(FusedCandidate {
                        chunk: candidate.chunk,
                        source: candidate.source,
                        best_rank: rank,
                    });
                }
                None => {}
            }
        }
    }

    tracing::debug!(
        pool = merged.len(),
        overlap = ?merged
            .iter()
            .filter(|c| c.source == CandidateSource::Both)
            .map(|c| (c.chunk.id.as_str(), c.best_rank))
            .collect::<Vec<_>>(),
        "Fused candidate pool"
    );
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Anchors, Chunk, SectionType};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn candidates(ids: &[&str], source: CandidateSource) -> Vec<RetrievalCandidate> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RetrievalCandidate {
                chunk: Arc::new(Chunk::new(*id, format!("text {id}"), Anchors::new("f.pdf", 1, SectionType::Body))),
                score: 10.0 - i as f32,
                source,
            })
            .collect()
    }

    fn ids(fused: &[FusedCandidate]) -> Vec<&str> {
        fused.iter().map(|c| c.chunk.id.as_str()).collect()
    }

    #[test]
    fn test_round_robin_order() {
        let fused = interleave_fusion(
            candidates(&["d1", "d2", "d3"], CandidateSource::Dense),
            candidates(&["s1", "s2"], CandidateSource::Sparse),
            40,
        );
        assert_eq!(ids(&fused), vec!["d1", "s1", "d2", "s2", "d3"]);
    }

    #[test]
    fn test_overlap_tagged_both_with_best_rank() {
        let fused = interleave_fusion(
            candidates(&["a", "b", "c"], CandidateSource::Dense),
            candidates(&["c", "x", "a"], CandidateSource::Sparse),
            40,
        );
        assert_eq!(ids(&fused), vec!["a", "c", "b", "x"]);

        let a = &fused[0];
        assert_eq!(a.source, CandidateSource::Both);
        assert_eq!(a.best_rank, 0);

        let c = &fused[1];
        assert_eq!(c.source, CandidateSource::Both);
        assert_eq!(c.best_rank, 0, "sparse rank 0 beats dense rank 2");

        assert_eq!(fused[2].source, CandidateSource::Dense);
        assert_eq!(fused[3].source, CandidateSource::Sparse);
    }

    #[test]
    fn test_no_duplicate_ids() {
        let dense: Vec<String> = (0..10).map(|i| format!("c{}", i)).collect();
        let sparse: Vec<String> = (5..15).map(|i| format!("c{}", i)).collect();
        let dense_refs: Vec<&str> = dense.iter().map(String::as_str).collect();
        let sparse_refs: Vec<&str> = sparse.iter().map(String::as_str).collect();

        let fused = interleave_fusion(
            candidates(&dense_refs, CandidateSource::Dense),
            candidates(&sparse_refs, CandidateSource::Sparse),
            40,
        );
        let unique: HashSet<_> = fused.iter().map(|c| c.chunk.id.clone()).collect();
        assert_eq!(unique.len(), fused.len());
        assert_eq!(fused.len(), 15);
    }

    #[test]
    fn test_truncates_to_pool_size() {
        let fused = interleave_fusion(
            candidates(&["d1", "d2", "d3", "d4"], CandidateSource::Dense),
            candidates(&["s1", "s2", "d4"], CandidateSource::Sparse),
            3,
        );
        assert_eq!(ids(&fused), vec!["d1", "s1", "d2"]);
    }

    #[test]
    fn test_one_empty_path() {
        let fused = interleave_fusion(
            Vec::new(),
            candidates(&["s1", "s2"], CandidateSource::Sparse),
            40,
        );
        assert_eq!(ids(&fused), vec!["s1", "s2"]);
        assert!(interleave_fusion(Vec::new(), Vec::new(), 40).is_empty());
    }
}
