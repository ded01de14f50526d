//! Second-stage relevance ordering of the fused candidate pool.

pub mod cross_encoder;
pub mod llm_reranker;

pub use cross_encoder::CrossEncoderReranker;
pub use llm_reranker::LlmReranker;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::error::Degradation;
use crate::types::{FusedCandidate, RankedResult};

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str;

    /// One relevance score per candidate, aligned with input order. Higher is better.
    async fn score(&self, query: &str, candidates: &[FusedCandidate]) -> Result<Vec<f32>>;
}

#[derive(Debug)]
pub struct RerankOutcome {
    pub results: Vec<RankedResult>,
    pub degradation: Option<Degradation>,
}

/// Rerank the pool and keep the best `top_n`.
///
/// Sorting is stable, so candidates with equal scores stay in fused order. When the
/// reranker errors, times out, or returns a malformed score vector, the fused order is
/// kept (truncated to `top_n`) and the outcome carries a [`Degradation::RerankDegraded`].
pub async fn rerank_pool(
    reranker: &dyn Reranker,
    query: &str,
    pool: Vec<FusedCandidate>,
    top_n: usize,
    timeout: Duration,
) -> RerankOutcome {
    if pool.is_empty() {
        return RerankOutcome {
            results: Vec::new(),
            degradation: None,
        };
    }

    let start = Instant::now();
    let scored = match tokio::time::timeout(timeout, reranker.score(query, &pool)).await {
        Ok(Ok(scores)) if scores.len() == pool.len() => Ok(scores),
        Ok(Ok(scores)) => Err(anyhow!(
            "returned {} scores for {} candidates",
            scores.len(),
            pool.len()
        )),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow!("timed out after {}ms", timeout.as_millis())),
    };

    match scored {
        Ok(scores) => {
            let mut order: Vec<usize> = (0..pool.len()).collect();
            // NaN sorts last. Equal scores fall back to the better per-path rank, then fused
            // position; interleaving makes both agree with fused order.
            let key = |i: usize| if scores[i].is_nan() { f32::NEG_INFINITY } else { scores[i] };
            order.sort_by(|&a, &b| {
                key(b)
                    .total_cmp(&key(a))
                    .then(pool[a].best_rank.cmp(&pool[b].best_rank))
                    .then(a.cmp(&b))
            });
            order.truncate(top_n);

            tracing::debug!(
                reranker = reranker.name(),
                pool = pool.len(),
                kept = order.len(),
                latency_ms = start.elapsed().as_millis() as u64,
                "Reranked candidate pool"
            );

            RerankOutcome {
                results: order
                    .into_iter()
                    .map(|i| RankedResult {
                        chunk: pool[i].chunk.clone(),
                        fused_rank: i,
                        source: pool[i].source,
                        rerank_score: Some(scores[i]),
                    })
                    .collect(),
                degradation: None,
            }
        }
        Err(e) => {
            tracing::warn!(
                reranker = reranker.name(),
                error = %e,
                "Reranking failed, keeping fused order"
            );
            RerankOutcome {
                results: pool
                    .into_iter()
                    .take(top_n)
                    .enumerate()
                    .map(|(i, c)| RankedResult {
                        chunk: c.chunk,
                        fused_rank: i,
                        source: c.source,
                        rerank_score: None,
                    })
                    .collect(),
                degradation: Some(Degradation::RerankDegraded {
                    reason: format!("{}: {}", reranker.name(), e),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Anchors, CandidateSource, Chunk, RetrievalCandidate, SectionType};
    use std::sync::Arc;

    struct FixedScores(Result<Vec<f32>, String>, Option<Duration>);

    #[async_trait]
    impl Reranker for FixedScores {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn score(&self, _query: &str, _candidates: &[FusedCandidate]) -> Result<Vec<f32>> {
            if let Some(delay) = self.1 {
                tokio::time::sleep(delay).await;
            }
            self.0.clone().map_err(|e| anyhow!(e))
        }
    }

    fn pool(n: usize) -> Vec<FusedCandidate> {
        (0..n)
            .map(|i| FusedCandidate {
                chunk: Arc::new(Chunk::new(format!("c{i}"), "t", Anchors::new("f.pdf", 1, SectionType::Body))),
                source: CandidateSource::Dense,
                best_rank: i,
            })
            .collect()
    }

    fn ids(outcome: &RerankOutcome) -> Vec<&str> {
        outcome.results.iter().map(|r| r.chunk.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_orders_by_score_and_truncates() {
        let reranker = FixedScores(Ok(vec![0.1, 0.9, 0.5, 0.7]), None);
        let outcome = rerank_pool(&reranker, "q", pool(4), 3, Duration::from_secs(1)).await;
        assert_eq!(ids(&outcome), vec!["c1", "c3", "c2"]);
        assert_eq!(outcome.results[0].fused_rank, 1);
        assert!(outcome.degradation.is_none());
    }

    #[tokio::test]
    async fn test_returns_min_of_top_n_and_pool() {
        let reranker = FixedScores(Ok(vec![0.3, 0.2]), None);
        let outcome = rerank_pool(&reranker, "q", pool(2), 8, Duration::from_secs(1)).await;
        assert_eq!(outcome.results.len(), 2);
    }

    #[tokio::test]
    async fn test_ties_keep_fused_order() {
        let reranker = FixedScores(Ok(vec![0.5; 6]), None);
        let outcome = rerank_pool(&reranker, "q", pool(6), 6, Duration::from_secs(1)).await;
        assert_eq!(ids(&outcome), vec!["c0", "c1", "c2", "c3", "c4", "c5"]);

        let reranker = FixedScores(Ok(vec![0.2, 0.9, 0.2, 0.9, 0.2]), None);
        let outcome = rerank_pool(&reranker, "q", pool(5), 5, Duration::from_secs(1)).await;
        assert_eq!(ids(&outcome), vec!["c1", "c3", "c0", "c2", "c4"]);
    }

    #[tokio::test]
    async fn test_ties_after_real_fusion_keep_fused_order() {
        let path = |ids: &[&str], source| {
            ids.iter()
                .map(|id| RetrievalCandidate {
                    chunk: Arc::new(Chunk::new(*id, "t", Anchors::new("f.pdf", 1, SectionType::Body))),
                    score: 1.0,
                    source,
                })
                .collect::<Vec<_>>()
        };
        let fused = crate::search::interleave_fusion(
            path(&["a", "b", "c"], CandidateSource::Dense),
            path(&["c", "x"], CandidateSource::Sparse),
            40,
        );
        let reranker = FixedScores(Ok(vec![0.5; fused.len()]), None);
        let outcome = rerank_pool(&reranker, "q", fused, 8, Duration::from_secs(1)).await;
        assert_eq!(ids(&outcome), vec!["a", "c", "b", "x"]);
        assert_eq!(outcome.results[1].source, CandidateSource::Both);
    }

    #[tokio::test]
    async fn test_failure_degrades_to_fused_order() {
        let reranker = FixedScores(Err("model offline".into()), None);
        let outcome = rerank_pool(&reranker, "q", pool(10), 8, Duration::from_secs(1)).await;
        assert_eq!(outcome.results.len(), 8);
        assert_eq!(outcome.results[0].chunk.id, "c0");
        assert!(outcome.results.iter().all(|r| r.rerank_score.is_none()));
        assert!(matches!(outcome.degradation, Some(Degradation::RerankDegraded { .. })));
    }

    #[tokio::test]
    async fn test_timeout_degrades() {
        let reranker = FixedScores(Ok(vec![1.0, 2.0]), Some(Duration::from_millis(200)));
        let outcome = rerank_pool(&reranker, "q", pool(2), 8, Duration::from_millis(20)).await;
        assert_eq!(ids(&outcome), vec!["c0", "c1"]);
        assert!(outcome.degradation.is_some());
    }

    #[tokio::test]
    async fn test_wrong_score_count_degrades() {
        let reranker = FixedScores(Ok(vec![1.0]), None);
        let outcome = rerank_pool(&reranker, "q", pool(3), 8, Duration::from_secs(1)).await;
        assert!(outcome.degradation.is_some());
        assert_eq!(outcome.results.len(), 3);
    }
}
