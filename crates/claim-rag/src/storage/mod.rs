//! Chunk storage: the LanceDB-backed corpus and an in-memory equivalent.
//!
//! Both are written during ingestion and only read while answering queries.

pub mod lance_store;
pub mod memory;

pub use lance_store::LanceStore;
pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

use crate::anchors::MetadataFilter;
use crate::types::Chunk;

/// A chunk together with its embedding, as handed to the vector index at ingestion.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk: Chunk,
    /// Cosine similarity, higher is closer.
    pub score: f32,
}

/// Read access to chunk records.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Fetch chunks by id. Unknown ids are skipped; order is not guaranteed.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// Enumerate chunks satisfying the filter, without ranking.
    async fn list_chunks(&self, filter: &MetadataFilter, limit: usize) -> Result<Vec<Chunk>>;

    /// Total character count of every chunk belonging to each named document.
    async fn document_chars(&self, file_names: &[String]) -> Result<HashMap<String, usize>>;
}

/// Nearest-neighbour search over chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorHit>>;
}
