use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Degradation;
use crate::tools::statistics::CorrelationMatrix;

/// Document region a chunk was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionType {
    Summary,
    Timeline,
    Body,
    Table,
    Figure,
    Header,
}

impl SectionType {
    pub const ALL: [SectionType; 6] = [
        Self::Summary,
        Self::Timeline,
        Self::Body,
        Self::Table,
        Self::Figure,
        Self::Header,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "Summary",
            Self::Timeline => "Timeline",
            Self::Body => "Body",
            Self::Table => "Table",
            Self::Figure => "Figure",
            Self::Header => "Header",
        }
    }
}

impl FromStr for SectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown section type '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentType {
    Accident,
    Collision,
    Burglary,
    Theft,
    Fire,
    Vandalism,
}

impl IncidentType {
    pub const ALL: [IncidentType; 6] = [
        Self::Accident,
        Self::Collision,
        Self::Burglary,
        Self::Theft,
        Self::Fire,
        Self::Vandalism,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accident => "accident",
            Self::Collision => "collision",
            Self::Burglary => "burglary",
            Self::Theft => "theft",
            Self::Fire => "fire",
            Self::Vandalism => "vandalism",
        }
    }
}

impl FromStr for IncidentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown incident type '{}'", s))
    }
}

/// Provenance attached to every chunk at ingestion. Field names serialize in the
/// PascalCase form used by filters and citations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Anchors {
    pub file_name: String,
    pub page_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_type: Option<SectionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub figure_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_type: Option<IncidentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
}

impl Anchors {
    pub fn new(file_name: impl Into<String>, page_number: u32, section_type: SectionType) -> Self {
        Self {
            file_name: file_name.into(),
            page_number,
            section_type: Some(section_type),
            table_id: None,
            figure_id: None,
            incident_date: None,
            incident_type: None,
            client_id: None,
            case_id: None,
        }
    }
}

/// Immutable retrievable unit. The embedding lives in the vector index, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub anchors: Anchors,
}

impl Chunk {
    pub fn new(id: impl Into<String>, text: impl Into<String>, anchors: Anchors) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            anchors,
        }
    }

    /// Length in characters, the unit every budget is expressed in.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Dense,
    Sparse,
    Both,
}

impl CandidateSource {
    /// Index backing the path, as named in `RetrievalUnavailable`.
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Dense => "vector",
            Self::Sparse => "keyword",
            Self::Both => "hybrid",
        }
    }
}

/// One hit from a single retrieval path. Scores are only comparable within that path.
#[derive(Debug, Clone)]
pub struct RetrievalCandidate {
    pub chunk: Arc<Chunk>,
    pub score: f32,
    pub source: CandidateSource,
}

/// A candidate after fusion. `best_rank` is the better (lower) of its per-path ranks.
#[derive(Debug, Clone)]
pub struct FusedCandidate {
    pub chunk: Arc<Chunk>,
    pub source: CandidateSource,
    pub best_rank: usize,
}

#[derive(Debug, Clone)]
pub struct RankedResult {
    pub chunk: Arc<Chunk>,
    /// Position in the fused pool, zero-based.
    pub fused_rank: usize,
    /// Which retrieval paths returned the chunk.
    pub source: CandidateSource,
    /// `None` when the reranker degraded and fused order was kept.
    pub rerank_score: Option<f32>,
}

/// Prefix of the reranked list admitted under the size policy.
#[derive(Debug, Clone, Default)]
pub struct BudgetedSet {
    pub chunks: Vec<RankedResult>,
    pub total_chars: usize,
    pub doc_total_chars: usize,
}

impl BudgetedSet {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().map(|r| r.chunk.as_ref())
    }
}

/// The four answering strategies. Routing can only ever yield one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Summary,
    Needle,
    TableQa,
    Statistics,
}

impl Tool {
    pub const ALL: [Tool; 4] = [Self::Summary, Self::Needle, Self::TableQa, Self::Statistics];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Needle => "needle",
            Self::TableQa => "table_qa",
            Self::Statistics => "statistics",
        }
    }

    /// Strict label parse. Accepts the `*_tool` suffix and hyphen/space variants, nothing else.
    pub fn from_label(raw: &str) -> Option<Self> {
        let normalized = raw
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.')
            .to_lowercase()
            .replace(['-', ' '], "_");
        let normalized = normalized.strip_suffix("_tool").unwrap_or(&normalized);
        match normalized {
            "summary" => Some(Self::Summary),
            "needle" => Some(Self::Needle),
            "table_qa" | "tableqa" => Some(Self::TableQa),
            "statistics" | "stats" => Some(Self::Statistics),
            _ => None,
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMethod {
    Llm,
    KeywordFallback,
    /// Tool forced by the caller.
    Override,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub tool: Tool,
    pub confidence: f32,
    pub method: RouteMethod,
    /// Set only when the question explicitly asks about correlation between values.
    pub correlation_intent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    Chunk(String),
    Table(String),
}

impl SourceRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Chunk(id) | Self::Table(id) => id,
        }
    }
}

/// Final result of a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub query_id: Uuid,
    pub text: String,
    pub tool_used: Tool,
    pub sources: Vec<SourceRef>,
    pub degraded: bool,
    pub degradations: Vec<Degradation>,
    pub route: RouteDecision,
    /// Anchors of the chunks the answer was grounded on, in budget order.
    pub citations: Vec<Anchors>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<CorrelationMatrix>,
}

impl Answer {
    pub const NO_RELEVANT_DOCUMENTS: &'static str =
        "No relevant documents were found for this question.";

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(SourceRef::id).collect()
    }
}
