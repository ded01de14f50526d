//! Dense and sparse retrieval paths and their fusion.

pub mod hybrid;
pub mod text_search;

pub use hybrid::interleave_fusion;
pub use text_search::{TextIndexWriter, TextSearch};

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::anchors::{validate_anchors, MetadataFilter};
use crate::embeddings::EmbeddingModel;
use crate::storage::{ChunkStore, VectorIndex};
use crate::types::{CandidateSource, Chunk, RetrievalCandidate};

/// One retrieval path. Results are ordered by the path's own score, best first.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn source(&self) -> CandidateSource;

    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievalCandidate>>;
}

/// Final gate applied to every retrieved chunk on both paths.
fn admit(chunk: Chunk, filter: &MetadataFilter) -> Option<Arc<Chunk>> {
    if let Err(e) = validate_anchors(&chunk.id, &chunk.anchors) {
        tracing::warn!(error = %e, "Dropping chunk with invalid anchors");
        return None;
    }
    if !filter.matches(&chunk.anchors) {
        tracing::warn!(chunk_id = %chunk.id, "Backend returned a chunk outside the filter");
        return None;
    }
    Some(Arc::new(chunk))
}

/// Embedding nearest-neighbour retrieval.
pub struct DenseRetriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingModel>,
}

impl DenseRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn EmbeddingModel>) -> Self {
        Self { index, embedder }
    }
}

#[async_trait]
impl Retriever for DenseRetriever {
    fn source(&self) -> CandidateSource {
        CandidateSource::Dense
    }

    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievalCandidate>> {
        let vector = self
            .embedder
            .embed_query(query)
            .await
            .context("Failed to embed query")?;
        let hits = self.index.vector_search(&vector, k, filter).await?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                admit(hit.chunk, filter).map(|chunk| RetrievalCandidate {
                    chunk,
                    score: hit.score,
                    source: self.source(),
                })
            })
            .collect())
    }
}

/// BM25 keyword retrieval. Hits are resolved to full chunks through the chunk store.
pub struct SparseRetriever {
    text: Arc<TextSearch>,
    store: Arc<dyn ChunkStore>,
}

impl SparseRetriever {
    pub fn new(text: Arc<TextSearch>, store: Arc<dyn ChunkStore>) -> Self {
        Self { text, store }
    }
}

#[async_trait]
impl Retriever for SparseRetriever {
    fn source(&self) -> CandidateSource {
        CandidateSource::Sparse
    }

    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievalCandidate>> {
        let text = Arc::clone(&self.text);
        let owned_query = query.to_string();
        let owned_filter = filter.clone();
        let hits = tokio::task::spawn_blocking(move || text.search(&owned_query, k, &owned_filter))
            .await
            .context("Keyword search task panicked")??;

        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = hits.iter().map(|(id, _)| id.clone()).collect();
        let mut chunks: HashMap<String, Chunk> = self
            .store
            .get_by_ids(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut out = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            let Some(chunk) = chunks.remove(&id) else {
                tracing::warn!(chunk_id = %id, "Keyword hit missing from chunk store");
                continue;
            };
            if let Some(chunk) = admit(chunk, filter) {
                out.push(RetrievalCandidate {
                    chunk,
                    score,
                    source: self.source(),
                });
            }
        }
        Ok(out)
    }
}
