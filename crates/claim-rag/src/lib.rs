//! Query-time retrieval and answering over insurance claim documents.
//!
//! A question plus a metadata filter goes through concurrent routing and hybrid retrieval,
//! interleave fusion, reranking and a character budget before one of four answering tools
//! produces an [`Answer`] with its sources.

pub mod anchors;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod indexing;
pub mod llm;
pub mod rag;
pub mod rag_engine;
pub mod reranking;
pub mod search;
pub mod storage;
pub mod tables;
pub mod telemetry;
pub mod tools;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export primary types for convenience
pub use anchors::{FilterCondition, MetadataFilter};
pub use config::RAGConfig;
pub use error::{Degradation, RagError, RagResult};
pub use indexing::{CorpusBuilder, SealedCorpus};
pub use rag_engine::{EngineParts, RAGEngine};
pub use tables::{TableRecord, TableRegistry};
pub use tools::CorrelationMatrix;
pub use types::{
    Anchors, Answer, Chunk, IncidentType, RouteDecision, RouteMethod, SectionType, SourceRef, Tool,
};

// Re-export LLM types
pub use llm::{ApiProvider, GenerationConfig, LLMConfig, LLMManager, LLMMode, ProviderInfo};

pub use uuid::Uuid;
