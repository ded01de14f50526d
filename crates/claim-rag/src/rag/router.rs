//! LLM-based tool router with a keyword fallback.
//!
//! A single LLM call classifies the question into the closed four-tool taxonomy. Anything
//! other than a clean in-taxonomy label (error, timeout, garbage, unknown label) is treated
//! as a classification failure and the keyword heuristic decides instead, so routing always
//! terminates with one of the four tools.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use crate::error::Degradation;
use crate::llm::LLMManager;
use crate::types::{RouteDecision, RouteMethod, Tool};

static TOOL_LINE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?im)^\s*tool\s*[:=]\s*([a-z_\- ]+?)\s*$").expect("tool line regex is valid")
});

// Checked in this order; the first vocabulary with a hit wins.
const STATISTICS_TERMS: &[&str] = &[
    "compare", "comparison", "correlation", "correlate", "trend", "trends", "pattern", "patterns",
    "across", "between", "versus", "vs", "relationship", "association", "average",
    "distribution",
];
const TABLE_QA_TERMS: &[&str] = &[
    "total", "amount", "limit", "sum", "premium", "deductible", "settlement", "payment",
    "payments", "cost", "costs", "count", "table", "row", "column",
];
const TABLE_QA_PHRASES: &[&str] = &["how much", "how many"];
const NEEDLE_TERMS: &[&str] = &[
    "exact", "exactly", "quote", "percent", "percentage", "page", "figure", "clause", "wording",
];
const CORRELATION_TERMS: &[&str] = &[
    "correlation", "correlate", "correlated", "relationship", "association", "associated",
    "related", "link", "linked",
];

const KEYWORD_CONFIDENCE: f32 = 0.6;
const DEFAULT_CONFIDENCE: f32 = 0.3;
const LLM_DEFAULT_CONFIDENCE: f32 = 0.8;
const ROUTER_OUTPUT_TOKENS: usize = 120;

const ROUTER_PROMPT: &str = r#"You are a query router for an insurance claims assistant. Classify the question into exactly one tool:

- "summary": overview or narrative of a claim, case or document ("what happened", "summarize", "describe the incident").
- "needle": a precise fact stated in the text (a date, a name, a clause, a percentage, an exact quote).
- "table_qa": a numeric value held in a table (totals, amounts, payments, premiums, deductibles, limits).
- "statistics": comparisons, trends or relationships across several tables or cases.

Output ONLY a JSON object: {"tool":"summary|needle|table_qa|statistics","confidence":0.0-1.0,"reasoning":"one sentence"}"#;

#[derive(Debug, Deserialize)]
struct RouterReply {
    tool: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    reasoning: String,
}

pub struct QueryRouter {
    llm: Arc<LLMManager>,
    timeout: Duration,
}

impl QueryRouter {
    pub fn new(llm: Arc<LLMManager>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Decide the tool for `query`. The degradation is set whenever the keyword fallback ran.
    pub async fn route(&self, query: &str) -> (RouteDecision, Option<Degradation>) {
        let correlation_intent = has_correlation_intent(query);
        let start = Instant::now();

        let classified = if self.llm.is_enabled() {
            match tokio::time::timeout(self.timeout, self.classify(query)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("router timed out after {}ms", self.timeout.as_millis())),
            }
        } else {
            Err(anyhow!("LLM is disabled"))
        };

        match classified {
            Ok((tool, confidence)) => {
                tracing::info!(
                    tool = %tool,
                    confidence,
                    correlation_intent,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "LLM router decision"
                );
                (
                    RouteDecision {
                        tool,
                        confidence,
                        method: RouteMethod::Llm,
                        correlation_intent,
                    },
                    None,
                )
            }
            Err(e) => {
                let decision = keyword_route(query);
                tracing::warn!(
                    error = %e,
                    tool = %decision.tool,
                    "LLM routing failed, using keyword fallback"
                );
                (
                    decision,
                    Some(Degradation::RouteFallback {
                        reason: e.to_string(),
                    }),
                )
            }
        }
    }

    async fn classify(&self, query: &str) -> Result<(Tool, f32)> {
        let prompt = format!("{}\n\nQuestion: \"{}\"\nJSON:", ROUTER_PROMPT, query);
        let raw = self
            .llm
            .generate_custom(&prompt, ROUTER_OUTPUT_TOKENS)
            .await
            .context("LLM router call failed")?;
        parse_router_response(&raw)
    }
}

/// Parse a router reply into an in-taxonomy tool.
///
/// Accepts a JSON object with a `tool` field (optionally fenced or embedded in prose) or a
/// `TOOL: <label>` line. Labels outside the taxonomy are errors.
fn parse_router_response(raw: &str) -> Result<(Tool, f32)> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json_str = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(&cleaned[start..=end]),
        _ => None,
    };

    if let Some(json_str) = json_str {
        if let Ok(reply) = serde_json::from_str::<RouterReply>(json_str) {
            let tool = Tool::from_label(&reply.tool)
                .ok_or_else(|| anyhow!("label '{}' is not a known tool", reply.tool))?;
            let confidence = reply
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(LLM_DEFAULT_CONFIDENCE);
            tracing::debug!(reasoning = %reply.reasoning, "Router reasoning");
            return Ok((tool, confidence));
        }
    }

    if let Some(caps) = TOOL_LINE_RE.captures(cleaned) {
        let label = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let tool =
            Tool::from_label(label).ok_or_else(|| anyhow!("label '{}' is not a known tool", label))?;
        return Ok((tool, LLM_DEFAULT_CONFIDENCE));
    }

    // A bare label is the last accepted shape
    Tool::from_label(cleaned)
        .map(|tool| (tool, LLM_DEFAULT_CONFIDENCE))
        .ok_or_else(|| {
            anyhow!(
                "unparseable router reply: {}",
                cleaned.chars().take(120).collect::<String>()
            )
        })
}

fn tokens(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_any(tokens: &[String], terms: &[&str]) -> bool {
    tokens.iter().any(|t| terms.contains(&t.as_str()))
}

pub fn has_correlation_intent(query: &str) -> bool {
    has_any(&tokens(query), CORRELATION_TERMS)
}

/// Deterministic keyword routing: Statistics, then Table-QA, then Needle, else Summary.
pub fn keyword_route(query: &str) -> RouteDecision {
    let toks = tokens(query);
    let lowered = query.to_lowercase();

    let hit = if has_any(&toks, STATISTICS_TERMS) {
        Some(Tool::Statistics)
    } else if has_any(&toks, TABLE_QA_TERMS) || TABLE_QA_PHRASES.iter().any(|p| lowered.contains(p)) {
        Some(Tool::TableQa)
    } else if has_any(&toks, NEEDLE_TERMS) {
        Some(Tool::Needle)
    } else {
        None
    };

    RouteDecision {
        tool: hit.unwrap_or(Tool::Summary),
        confidence: if hit.is_some() { KEYWORD_CONFIDENCE } else { DEFAULT_CONFIDENCE },
        method: RouteMethod::KeywordFallback,
        correlation_intent: has_any(&toks, CORRELATION_TERMS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LLMConfig;
    use crate::test_support::ScriptedLlm;

    fn router(llm: ScriptedLlm) -> QueryRouter {
        QueryRouter::new(llm.into_manager(), Duration::from_millis(100))
    }

    #[test]
    fn test_parse_valid_json() {
        let raw = r#"{"tool":"table_qa","confidence":0.92,"reasoning":"asks for a total"}"#;
        let (tool, confidence) = parse_router_response(raw).unwrap();
        assert_eq!(tool, Tool::TableQa);
        assert!((confidence - 0.92).abs() < 1e-6);
    }

    #[test]
    fn test_parse_json_with_fences_and_prose() {
        let raw = "Sure! ```json\n{\"tool\":\"needle\"}\n``` hope that helps";
        assert_eq!(parse_router_response(raw).unwrap().0, Tool::Needle);
    }

    #[test]
    fn test_parse_tool_line() {
        assert_eq!(parse_router_response("TOOL: statistics").unwrap().0, Tool::Statistics);
        assert_eq!(
            parse_router_response("Reasoning: totals\ntool: table-qa").unwrap().0,
            Tool::TableQa
        );
    }

    #[test]
    fn test_out_of_taxonomy_label_is_failure() {
        assert!(parse_router_response(r#"{"tool":"web_search"}"#).is_err());
        assert!(parse_router_response("TOOL: calculator").is_err());
        assert!(parse_router_response("I think this is about money").is_err());
    }

    #[test]
    fn test_keyword_precedence() {
        assert_eq!(keyword_route("Compare the total payments across cases").tool, Tool::Statistics);
        assert_eq!(keyword_route("How much was the total settlement for case CASE-103?").tool, Tool::TableQa);
        assert_eq!(keyword_route("Quote the exact towing clause").tool, Tool::Needle);
        assert_eq!(keyword_route("What happened to the client?").tool, Tool::Summary);
    }

    #[test]
    fn test_keyword_confidence_and_method() {
        let hit = keyword_route("what percentage of towing is covered");
        assert_eq!(hit.tool, Tool::Needle);
        assert_eq!(hit.confidence, KEYWORD_CONFIDENCE);
        assert_eq!(hit.method, RouteMethod::KeywordFallback);

        let miss = keyword_route("describe the incident");
        assert_eq!(miss.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_terms_match_whole_words_only() {
        // "summary" contains "sum" and "pages" contains "page"
        assert_eq!(keyword_route("give me a summary").tool, Tool::Summary);
    }

    #[test]
    fn test_correlation_intent_detection() {
        assert!(has_correlation_intent("Is repair cost related to labor hours?"));
        assert!(has_correlation_intent("correlation between premium and deductible"));
        assert!(!has_correlation_intent("What is the total settlement?"));
    }

    #[tokio::test]
    async fn test_llm_decision_used_when_valid() {
        let llm = ScriptedLlm::new().reply_when("query router", r#"{"tool":"summary","confidence":0.7}"#);
        let (decision, degradation) = router(llm).route("How much was paid?").await;
        assert_eq!(decision.tool, Tool::Summary);
        assert_eq!(decision.method, RouteMethod::Llm);
        assert!(degradation.is_none());
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_deterministically() {
        for llm in [
            ScriptedLlm::new().fail_when("query router"),
            ScriptedLlm::new().reply_when("query router", "banana"),
            ScriptedLlm::new().reply_when("query router", r#"{"tool":"unknown"}"#),
            ScriptedLlm::new().hang_when("query router"),
        ] {
            let (decision, degradation) = router(llm).route("What is the total settlement?").await;
            assert_eq!(decision.tool, Tool::TableQa);
            assert_eq!(decision.method, RouteMethod::KeywordFallback);
            assert!(matches!(degradation, Some(Degradation::RouteFallback { .. })));
        }
    }

    #[tokio::test]
    async fn test_disabled_llm_uses_fallback() {
        let router = QueryRouter::new(Arc::new(LLMManager::new(LLMConfig::default())), Duration::from_secs(1));
        let (decision, degradation) = router.route("compare trends").await;
        assert_eq!(decision.tool, Tool::Statistics);
        assert!(degradation.is_some());
    }

    #[tokio::test]
    async fn test_correlation_flag_set_on_llm_path() {
        let llm = ScriptedLlm::new().reply_when("query router", "TOOL: statistics");
        let (decision, _) = router(llm).route("Is cost correlated with labor hours?").await;
        assert!(decision.correlation_intent);
    }
}
