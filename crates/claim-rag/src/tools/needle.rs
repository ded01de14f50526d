use async_trait::async_trait;
use std::sync::Arc;

use super::{AnswerTool, ToolInput, ToolOutput};
use crate::error::{RagError, RagResult};
use crate::llm::LLMManager;
use crate::types::{Answer, Tool};

const NEEDLE_OUTPUT_TOKENS: usize = 512;

/// Precise-fact answering: one grounded synthesis call over the numbered budgeted chunks.
#[derive(Clone)]
pub struct NeedleTool {
    llm: Arc<LLMManager>,
}

impl NeedleTool {
    pub fn new(llm: Arc<LLMManager>) -> Self {
        Self { llm }
    }

    fn build_prompt(query: &str, input: &ToolInput<'_>) -> String {
        let context = input
            .budget
            .iter_chunks()
            .enumerate()
            .map(|(i, chunk)| {
                let a = &chunk.anchors;
                format!("[{}] {} p.{}\n{}", i + 1, a.file_name, a.page_number, chunk.text)
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            "Answer the question using only the numbered excerpts from insurance case documents.\n\n\
             Excerpts:\n{}\n\n\
             Question: {}\n\n\
             Instructions:\n\
             - Use the exact wording from the excerpts; quote directly when possible\n\
             - Cite excerpts by number, e.g. [2]\n\
             - Do not add information that is not in the excerpts\n\
             - If the answer is not in the excerpts, say \"Information not available in the provided documents\"\n\n\
             Answer:",
            context, query
        )
    }
}

#[async_trait]
impl AnswerTool for NeedleTool {
    fn tool(&self) -> Tool {
        Tool::Needle
    }

    async fn answer(&self, input: &ToolInput<'_>) -> RagResult<ToolOutput> {
        if input.budget.is_empty() {
            return Ok(ToolOutput::from_budget(
                Tool::Needle,
                Answer::NO_RELEVANT_DOCUMENTS.to_string(),
                input.budget,
            ));
        }

        let prompt = Self::build_prompt(input.query, input);
        let text = self
            .llm
            .generate_custom(&prompt, NEEDLE_OUTPUT_TOKENS)
            .await
            .map_err(|e| RagError::Generation(format!("needle synthesis: {:#}", e)))?;

        Ok(ToolOutput::from_budget(Tool::Needle, text.trim().to_string(), input.budget))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{budget_of, ScriptedLlm};
    use crate::types::{RouteDecision, RouteMethod, SourceRef};

    fn route() -> RouteDecision {
        RouteDecision {
            tool: Tool::Needle,
            confidence: 1.0,
            method: RouteMethod::Override,
            correlation_intent: false,
        }
    }

    #[tokio::test]
    async fn test_cites_budgeted_chunks_in_order() {
        let llm = ScriptedLlm::new().reply_when("numbered excerpts", "\"Exactly 20 percent\" [1]");
        let prompts = llm.prompts();
        let tool = NeedleTool::new(llm.into_manager());
        let budget = budget_of(&["c103-policy", "c103-summary"]);
        let route = route();
        let input = ToolInput {
            query: "What percent of towing is reimbursed?",
            route: &route,
            budget: &budget,
            tables: &[],
        };

        let out = tool.answer(&input).await.unwrap();
        assert_eq!(out.text, "\"Exactly 20 percent\" [1]");
        assert_eq!(
            out.sources,
            vec![
                SourceRef::Chunk("c103-policy".into()),
                SourceRef::Chunk("c103-summary".into())
            ]
        );
        assert_eq!(out.citations[0].page_number, 4);
        let prompt = prompts.lock()[0].clone();
        assert!(prompt.contains("[1] case_103_claim.pdf p.4"));
    }

    #[tokio::test]
    async fn test_llm_failure_is_generation_error() {
        let tool = NeedleTool::new(ScriptedLlm::new().into_manager());
        let budget = budget_of(&["c103-policy"]);
        let route = route();
        let input = ToolInput {
            query: "q",
            route: &route,
            budget: &budget,
            tables: &[],
        };
        assert!(matches!(tool.answer(&input).await, Err(RagError::Generation(_))));
    }
}
