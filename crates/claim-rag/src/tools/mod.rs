//! The four answering strategies and their dispatch.
//!
//! Text tools (Summary, Needle) answer from the budgeted chunks. Table tools (Table-QA,
//! Statistics) answer from the tables linked to the query's filter and fall back to text
//! when no usable table exists.

pub mod needle;
pub mod statistics;
pub mod summary;
pub mod table_qa;

pub use needle::NeedleTool;
pub use statistics::{CorrelationMatrix, StatisticsTool};
pub use summary::SummaryTool;
pub use table_qa::TableQaTool;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::RagResult;
use crate::llm::LLMManager;
use crate::tables::TableRecord;
use crate::types::{Anchors, BudgetedSet, RouteDecision, SourceRef, Tool};

/// Everything a tool may read for one query.
pub struct ToolInput<'a> {
    pub query: &'a str,
    pub route: &'a RouteDecision,
    pub budget: &'a BudgetedSet,
    /// Tables linked to the query's filter. Empty for text tools.
    pub tables: &'a [TableRecord],
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// The tool that actually produced the answer, after any fallback.
    pub tool_used: Tool,
    pub text: String,
    pub sources: Vec<SourceRef>,
    pub citations: Vec<Anchors>,
    pub correlation: Option<CorrelationMatrix>,
}

impl ToolOutput {
    /// Output citing every chunk of the budget, in budget order.
    fn from_budget(tool_used: Tool, text: String, budget: &BudgetedSet) -> Self {
        Self {
            tool_used,
            text,
            sources: budget
                .iter_chunks()
                .map(|c| SourceRef::Chunk(c.id.clone()))
                .collect(),
            citations: budget.iter_chunks().map(|c| c.anchors.clone()).collect(),
            correlation: None,
        }
    }

    /// Output citing the given tables, deduplicated in order.
    fn from_tables<'t>(
        tool_used: Tool,
        text: String,
        tables: impl IntoIterator<Item = &'t TableRecord>,
    ) -> Self {
        let mut seen = HashSet::new();
        let used: Vec<&TableRecord> = tables
            .into_iter()
            .filter(|t| seen.insert(t.table_id.as_str()))
            .collect();
        Self {
            tool_used,
            text,
            sources: used.iter().map(|t| SourceRef::Table(t.table_id.clone())).collect(),
            citations: used.iter().map(|t| t.anchors()).collect(),
            correlation: None,
        }
    }
}

#[async_trait]
pub trait AnswerTool: Send + Sync {
    fn tool(&self) -> Tool;

    async fn answer(&self, input: &ToolInput<'_>) -> RagResult<ToolOutput>;
}

/// Owns one instance of every tool and routes a decision to it.
pub struct ToolSet {
    summary: SummaryTool,
    needle: NeedleTool,
    table_qa: TableQaTool,
    statistics: StatisticsTool,
}

impl ToolSet {
    pub fn new(llm: Arc<LLMManager>) -> Self {
        let needle = NeedleTool::new(Arc::clone(&llm));
        let table_qa = TableQaTool::new(needle.clone());
        Self {
            summary: SummaryTool::new(llm),
            statistics: StatisticsTool::new(table_qa.clone(), needle.clone()),
            needle,
            table_qa,
        }
    }

    pub fn get(&self, tool: Tool) -> &dyn AnswerTool {
        match tool {
            Tool::Summary => &self.summary,
            Tool::Needle => &self.needle,
            Tool::TableQa => &self.table_qa,
            Tool::Statistics => &self.statistics,
        }
    }

    pub async fn dispatch(&self, tool: Tool, input: &ToolInput<'_>) -> RagResult<ToolOutput> {
        let output = self.get(tool).answer(input).await?;
        tracing::info!(
            routed = %tool,
            answered_by = %output.tool_used,
            sources = output.sources.len(),
            correlation = output.correlation.is_some(),
            "Tool dispatched"
        );
        Ok(output)
    }
}

/// Lowercased alphanumeric tokens without common function words.
pub(crate) fn content_tokens(text: &str) -> HashSet<String> {
    const STOPWORDS: &[&str] = &[
        "a", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from", "how",
        "in", "is", "it", "much", "of", "on", "or", "the", "to", "was", "were", "what", "which",
        "who", "with",
    ];
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(|t| t.strip_suffix('s').filter(|s| s.len() > 2).unwrap_or(t).to_string())
        .collect()
}

/// Format a computed value: integers without decimals, others with two.
pub(crate) fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_tokens_strip_stopwords_and_plurals() {
        let tokens = content_tokens("How much were the total Payments for case CASE-103?");
        assert!(tokens.contains("payment"));
        assert!(tokens.contains("total"));
        assert!(tokens.contains("103"));
        assert!(!tokens.contains("how"));
        assert!(!tokens.contains("the"));
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(12500.0), "12500");
        assert_eq!(format_value(2.5), "2.50");
    }
}
