//! Error taxonomy for the query pipeline.
//!
//! Fatal conditions propagate as [`RagError`]. Recoverable component failures never surface
//! as errors; they are recorded as a [`Degradation`] on the answer instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RagResult<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    /// A retrieval backend (vector index, keyword index, embedding service) failed or timed out.
    #[error("retrieval unavailable ({backend}): {reason}")]
    RetrievalUnavailable { backend: &'static str, reason: String },

    #[error("table '{table_id}' is not present in the table registry")]
    TableNotFound { table_id: String },

    #[error("table '{table_id}' could not be loaded: {reason}")]
    TableUnreadable { table_id: String, reason: String },

    /// The budget allocator produced a set breaking its own bounds. Indicates a bug.
    #[error("chunk budget violated: {0}")]
    BudgetViolation(String),

    #[error("invalid metadata filter: {0}")]
    InvalidFilter(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid anchors on chunk '{chunk_id}': {reason}")]
    InvalidAnchors { chunk_id: String, reason: String },

    #[error("answer generation failed: {0}")]
    Generation(String),
}

impl RagError {
    pub fn retrieval(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Self::RetrievalUnavailable {
            backend,
            reason: err.to_string(),
        }
    }

    /// Whether the error aborts the whole query rather than a single tool.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::TableNotFound { .. } | Self::TableUnreadable { .. } | Self::Generation(_)
        )
    }
}

/// A locally recovered failure. Any degradation marks the answer `degraded = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// Reranker failed or timed out; fused order was used.
    RerankDegraded { reason: String },
    /// LLM classification failed; the keyword heuristic picked the tool.
    RouteFallback { reason: String },
}

impl std::fmt::Display for Degradation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RerankDegraded { reason } => write!(f, "rerank degraded: {}", reason),
            Self::RouteFallback { reason } => write!(f, "route fallback: {}", reason),
        }
    }
}
