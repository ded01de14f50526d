//! Listwise reranking with one LLM call.
//!
//! Dense and sparse scores are not comparable, so the fused pool carries no usable global
//! ordering. The model sees every snippet at once and returns a permutation, which is
//! turned into per-candidate scores.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use super::Reranker;
use crate::llm::LLMManager;
use crate::types::FusedCandidate;

const MAX_JUDGED: usize = 40;
const SNIPPET_CHARS: usize = 300;
const JUDGE_OUTPUT_TOKENS: usize = 256;

pub struct LlmReranker {
    llm: Arc<LLMManager>,
}

impl LlmReranker {
    pub fn new(llm: Arc<LLMManager>) -> Self {
        Self { llm }
    }

    fn judge_prompt(query: &str, candidates: &[FusedCandidate]) -> String {
        let mut snippets = String::new();
        for (i, candidate) in candidates.iter().enumerate() {
            let anchors = &candidate.chunk.anchors;
            let section = anchors.section_type.map(|s| s.as_str()).unwrap_or("Body");
            let text: String = candidate.chunk.text.chars().take(SNIPPET_CHARS).collect();
            snippets.push_str(&format!(
                "[{}] {} p.{} {}: {}\n",
                i + 1,
                anchors.file_name,
                anchors.page_number,
                section,
                text
            ));
        }

        format!(
            "You are a search relevance judge for insurance claim files. Order the numbered \
             snippets by how directly each one helps answer the question. Table snippets matter \
             for amounts and totals.\n\n\
             Question: \"{query}\"\n\n\
             {snippets}\n\
             Reply with a JSON array holding every number from 1 to {n} exactly once, best first, \
             for example [2, 1, 3]. Reply with the array only.",
            n = candidates.len()
        )
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn score(&self, query: &str, candidates: &[FusedCandidate]) -> Result<Vec<f32>> {
        if candidates.len() <= 1 {
            return Ok(vec![1.0; candidates.len()]);
        }

        let judged = candidates.len().min(MAX_JUDGED);
        let reply = self
            .llm
            .generate_custom(&Self::judge_prompt(query, &candidates[..judged]), JUDGE_OUTPUT_TOKENS)
            .await?;

        let ranking = Ranking::parse(&reply, judged).ok_or_else(|| {
            anyhow!(
                "unparseable ranking: {}",
                reply.chars().take(200).collect::<String>()
            )
        })?;
        tracing::debug!(order = ?ranking.0, judged, "LLM ranking parsed");

        Ok(ranking.scores(candidates.len()))
    }
}

/// Zero-based candidate positions, best first, no repeats.
#[derive(Debug, PartialEq)]
struct Ranking(Vec<usize>);

impl Ranking {
    /// Accepts a bare JSON array, an array embedded in prose or code fences, or as a last
    /// resort loose integers. Embedded arrays are tried last to first, since models tend to
    /// cite snippets before stating the order. Either way at least half the positions must
    /// be ranked.
    fn parse(reply: &str, count: usize) -> Option<Self> {
        let text = reply.trim();

        let mut groups = Vec::new();
        let mut rest = text;
        let mut offset = 0;
        while let Some(start) = rest.find('[') {
            let Some(end) = rest[start..].find(']') else {
                break;
            };
            groups.push(&text[offset + start..=offset + start + end]);
            offset += start + end + 1;
            rest = &text[offset..];
        }

        for candidate in std::iter::once(text).chain(groups.into_iter().rev()) {
            if let Ok(numbers) = serde_json::from_str::<Vec<usize>>(candidate) {
                if let Some(ranking) = Self::strict(&numbers, count) {
                    return Some(ranking);
                }
            }
        }

        let mut seen = HashSet::new();
        let loose: Vec<usize> = text
            .split(|c: char| !c.is_ascii_digit())
            .filter_map(|s| s.parse::<usize>().ok())
            .filter(|n| (1..=count).contains(n) && seen.insert(*n))
            .map(|n| n - 1)
            .collect();
        Self::covers_enough(loose.len(), count).then_some(Self(loose))
    }

    fn covers_enough(ranked: usize, count: usize) -> bool {
        ranked > 0 && ranked >= (count + 1) / 2
    }

    /// Every number within `1..=count`, none repeated, half or more of them present.
    fn strict(numbers: &[usize], count: usize) -> Option<Self> {
        let mut seen = HashSet::new();
        let valid = Self::covers_enough(numbers.len(), count)
            && numbers
                .iter()
                .all(|n| (1..=count).contains(n) && seen.insert(*n));
        valid.then(|| Self(numbers.iter().map(|n| n - 1).collect()))
    }

    /// First-ranked scores `len`, the next `len - 1`, and so on. Unranked candidates score 0
    /// and so keep their fused order behind the ranked ones.
    fn scores(&self, total: usize) -> Vec<f32> {
        let mut scores = vec![0.0f32; total];
        let n = self.0.len();
        for (position, &idx) in self.0.iter().enumerate() {
            if idx < total {
                scores[idx] = (n - position) as f32;
            }
        }
        scores
    }
}
