//! Map-reduce summarisation over the budgeted chunks.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;

use super::{AnswerTool, ToolInput, ToolOutput};
use crate::error::{RagError, RagResult};
use crate::llm::LLMManager;
use crate::types::{Chunk, Tool};

const MAP_CHUNK_CHARS: usize = 2000;
const MAP_OUTPUT_TOKENS: usize = 300;
const REDUCE_OUTPUT_TOKENS: usize = 800;
pub const NO_RELEVANT_INFORMATION: &str = "No relevant information found for the given query.";

#[derive(Clone)]
pub struct SummaryTool {
    llm: Arc<LLMManager>,
}

impl SummaryTool {
    pub fn new(llm: Arc<LLMManager>) -> Self {
        Self { llm }
    }

    fn map_prompt(query: &str, chunk: &Chunk) -> String {
        let mut text: String = chunk.text.chars().take(MAP_CHUNK_CHARS).collect();
        if chunk.char_len() > MAP_CHUNK_CHARS {
            text.push_str("...");
        }
        format!(
            "You summarize excerpts of insurance case documents for a specific question.\n\n\
             Question: {}\n\n\
             Summarize the facts in the excerpt that relate to the question. Be inclusive of \
             anything tangentially related, and keep different people clearly distinguished. \
             If the excerpt is completely unrelated, reply exactly \"Not relevant\".\n\n\
             Excerpt ({} p.{}):\n{}\n\n\
             Summary:",
            query, chunk.anchors.file_name, chunk.anchors.page_number, text
        )
    }

    fn reduce_prompt(query: &str, partials: &[String]) -> String {
        let numbered = partials
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Combine the partial summaries below into one coherent summary that answers the \
             question. Remove redundancy, keep the facts grouped logically, and do not confuse \
             different people.\n\n\
             Question: {}\n\n\
             Partial summaries:\n{}\n\n\
             Combined summary:",
            query, numbered
        )
    }
}

fn is_not_relevant(partial: &str) -> bool {
    let lower = partial.to_lowercase();
    lower.is_empty() || lower.contains("not relevant") || lower.contains("not directly relevant")
}

#[async_trait]
impl AnswerTool for SummaryTool {
    fn tool(&self) -> Tool {
        Tool::Summary
    }

    async fn answer(&self, input: &ToolInput<'_>) -> RagResult<ToolOutput> {
        // Map: one call per chunk, run concurrently
        let calls = input.budget.iter_chunks().map(|chunk| {
            let prompt = Self::map_prompt(input.query, chunk);
            let llm = Arc::clone(&self.llm);
            async move { llm.generate_custom(&prompt, MAP_OUTPUT_TOKENS).await }
        });
        let mapped = join_all(calls).await;

        let mut partials = Vec::with_capacity(mapped.len());
        for result in mapped {
            let partial = result.map_err(|e| RagError::Generation(format!("summary map: {:#}", e)))?;
            let partial = partial.trim().to_string();
            if !is_not_relevant(&partial) {
                partials.push(partial);
            }
        }
        tracing::debug!(
            mapped = input.budget.len(),
            relevant = partials.len(),
            "Summary map phase finished"
        );

        let text = if partials.is_empty() {
            NO_RELEVANT_INFORMATION.to_string()
        } else {
            self.llm
                .generate_custom(&Self::reduce_prompt(input.query, &partials), REDUCE_OUTPUT_TOKENS)
                .await
                .map_err(|e| RagError::Generation(format!("summary reduce: {:#}", e)))?
                .trim()
                .to_string()
        };

        Ok(ToolOutput::from_budget(Tool::Summary, text, input.budget))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{budget_of, ScriptedLlm};
    use crate::types::{RouteDecision, RouteMethod};

    fn route() -> RouteDecision {
        RouteDecision {
            tool: Tool::Summary,
            confidence: 1.0,
            method: RouteMethod::Override,
            correlation_intent: false,
        }
    }

    #[tokio::test]
    async fn test_irrelevant_partials_dropped_before_reduce() {
        let llm = ScriptedLlm::new()
            .reply_when("Partial summaries", "Case 103 was a rear-end collision settled in April.")
            .reply_when("warehouse floor plan", "Not relevant")
            .reply_when("Excerpt (", "Rear-end collision reported 2024-03-14.");
        let prompts = llm.prompts();
        let tool = SummaryTool::new(llm.into_manager());
        let budget = budget_of(&["c103-summary", "c104-figure"]);
        let route = route();
        let input = ToolInput {
            query: "What happened in case 103?",
            route: &route,
            budget: &budget,
            tables: &[],
        };

        let out = tool.answer(&input).await.unwrap();
        assert_eq!(out.text, "Case 103 was a rear-end collision settled in April.");
        assert_eq!(out.sources.len(), 2);

        let prompts = prompts.lock();
        assert_eq!(prompts.len(), 3);
        let reduce = prompts.iter().find(|p| p.contains("Partial summaries")).unwrap();
        assert!(reduce.contains("1. Rear-end collision reported 2024-03-14."));
        assert!(!reduce.contains("2."));
    }

    #[tokio::test]
    async fn test_all_irrelevant_skips_reduce() {
        let llm = ScriptedLlm::new().reply_when("Excerpt (", "Not relevant");
        let prompts = llm.prompts();
        let tool = SummaryTool::new(llm.into_manager());
        let budget = budget_of(&["c104-figure"]);
        let route = route();
        let input = ToolInput {
            query: "premium history",
            route: &route,
            budget: &budget,
            tables: &[],
        };
        let out = tool.answer(&input).await.unwrap();
        assert_eq!(out.text, NO_RELEVANT_INFORMATION);
        assert_eq!(prompts.lock().len(), 1);
    }

    #[test]
    fn test_map_prompt_truncates_long_chunks() {
        let chunk = Chunk::new(
            "long",
            "y".repeat(5000),
            crate::types::Anchors::new("a.pdf", 1, crate::types::SectionType::Body),
        );
        let prompt = SummaryTool::map_prompt("q", &chunk);
        assert!(prompt.contains(&format!("{}...", "y".repeat(MAP_CHUNK_CHARS))));
        assert!(!prompt.contains(&"y".repeat(MAP_CHUNK_CHARS + 1)));
    }
}
