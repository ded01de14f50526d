//! Metadata-aware chunk budget.
//!
//! Keeps the longest reranked prefix that fits both a chunk-count cap and a character cap
//! proportional to the size of the documents involved.

use std::collections::{HashMap, HashSet};

use crate::error::{RagError, RagResult};
use crate::types::{BudgetedSet, RankedResult};

/// Sum of the character totals of every distinct `FileName` appearing in `ranked`.
/// Files missing from `doc_chars` fall back to the chars of their ranked chunks.
pub fn doc_total_chars(ranked: &[RankedResult], doc_chars: &HashMap<String, usize>) -> usize {
    let mut fallback: HashMap<&str, usize> = HashMap::new();
    for r in ranked {
        *fallback.entry(r.chunk.anchors.file_name.as_str()).or_default() += r.chunk.char_len();
    }
    fallback
        .into_iter()
        .map(|(file, local)| doc_chars.get(file).copied().unwrap_or(local).max(local))
        .sum()
}

/// Greedy prefix selection in rerank order.
///
/// The first chunk is always admitted. After that, selection stops at the first chunk that
/// would push the count past `max_chunks` or the characters past
/// `budget_fraction * doc_total_chars`.
pub fn allocate(
    ranked: Vec<RankedResult>,
    doc_total_chars: usize,
    max_chunks: usize,
    budget_fraction: f64,
) -> RagResult<BudgetedSet> {
    let char_cap = (budget_fraction * doc_total_chars as f64).floor() as usize;
    let max_chunks = max_chunks.max(1);

    let mut chunks = Vec::new();
    let mut total_chars = 0usize;
    for result in ranked {
        let len = result.chunk.char_len();
        if !chunks.is_empty() && (chunks.len() >= max_chunks || total_chars + len > char_cap) {
            break;
        }
        total_chars += len;
        chunks.push(result);
    }

    let set = BudgetedSet {
        chunks,
        total_chars,
        doc_total_chars,
    };
    check_bounds(&set, max_chunks, char_cap)?;

    tracing::debug!(
        selected = set.len(),
        total_chars = set.total_chars,
        char_cap,
        doc_total_chars,
        "Chunk budget allocated"
    );
    Ok(set)
}

fn check_bounds(set: &BudgetedSet, max_chunks: usize, char_cap: usize) -> RagResult<()> {
    if set.len() > max_chunks {
        return Err(RagError::BudgetViolation(format!(
            "{} chunks selected, cap is {}",
            set.len(),
            max_chunks
        )));
    }
    if set.len() > 1 && set.total_chars > char_cap {
        return Err(RagError::BudgetViolation(format!(
            "{} chars selected across {} chunks, cap is {}",
            set.total_chars,
            set.len(),
            char_cap
        )));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = set.chunks.iter().find(|r| !seen.insert(r.chunk.id.as_str())) {
        return Err(RagError::BudgetViolation(format!(
            "chunk '{}' selected twice",
            dup.chunk.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Anchors, CandidateSource, Chunk, SectionType};
    use std::sync::Arc;

    fn ranked(lengths: &[usize]) -> Vec<RankedResult> {
        lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| RankedResult {
                chunk: Arc::new(Chunk::new(
                    format!("c{i}"),
                    "x".repeat(len),
                    Anchors::new(format!("doc{}.pdf", i % 3), 1, SectionType::Body),
                )),
                fused_rank: i,
                source: CandidateSource::Dense,
                rerank_score: None,
            })
            .collect()
    }

    #[test]
    fn test_stops_at_char_cap() {
        // cap = 0.05 * 10_000 = 500
        let set = allocate(ranked(&[200, 200, 200, 50]), 10_000, 10, 0.05).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.total_chars, 400);
    }

    #[test]
    fn test_stops_at_first_breach_not_best_fit() {
        // the 50-char chunk would fit but comes after a breaching one
        let set = allocate(ranked(&[300, 300, 50]), 10_000, 10, 0.05).unwrap();
        let ids: Vec<_> = set.chunks.iter().map(|r| r.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["c0"]);
    }

    #[test]
    fn test_stops_at_max_chunks() {
        let set = allocate(ranked(&[10; 20]), 1_000_000, 10, 0.05).unwrap();
        assert_eq!(set.len(), 10);
    }

    #[test]
    fn test_first_chunk_always_included() {
        let set = allocate(ranked(&[5_000, 10]), 1_000, 10, 0.05).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.total_chars, 5_000);
    }

    #[test]
    fn test_empty_input_gives_empty_set() {
        let set = allocate(Vec::new(), 0, 10, 0.05).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_bounds_hold_over_many_shapes() {
        let mut seed = 7u64;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };
        for _ in 0..500 {
            let n = next() % 25;
            let lengths: Vec<usize> = (0..n).map(|_| 1 + next() % 2_000).collect();
            let doc_total = next() % 200_000;
            let max_chunks = 1 + next() % 12;
            let set = allocate(ranked(&lengths), doc_total, max_chunks, 0.05).unwrap();

            assert!(set.len() <= max_chunks);
            if n > 0 {
                assert!(!set.is_empty());
            }
            if set.len() > 1 {
                assert!(set.total_chars as f64 <= 0.05 * doc_total as f64);
            }
            // always a prefix
            for (i, r) in set.chunks.iter().enumerate() {
                assert_eq!(r.fused_rank, i);
            }
        }
    }

    #[test]
    fn test_doc_total_chars_counts_each_file_once() {
        let results = ranked(&[10, 10, 10, 10]); // doc0, doc1, doc2, doc0
        let mut doc_chars = HashMap::new();
        doc_chars.insert("doc0.pdf".to_string(), 1_000);
        doc_chars.insert("doc1.pdf".to_string(), 2_000);
        // doc2 unknown to the store: its ranked chars are used
        assert_eq!(doc_total_chars(&results, &doc_chars), 3_010);
    }
}
