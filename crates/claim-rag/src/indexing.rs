//! Ingestion: the only stage allowed to write the vector and keyword indexes.
//!
//! A [`CorpusBuilder`] validates anchors, embeds chunk text, and writes both indexes.
//! [`CorpusBuilder::finish`] consumes the builder and returns a [`SealedCorpus`] of
//! read-only handles, which is what the query engine is built from.

use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::anchors::validate_anchors;
use crate::config::RAGConfig;
use crate::embeddings::EmbeddingModel;
use crate::search::{TextIndexWriter, TextSearch};
use crate::storage::{ChunkStore, EmbeddedChunk, LanceStore, MemoryStore, VectorIndex};
use crate::types::Chunk;

/// Chunks embedded per request during ingestion.
const EMBED_BATCH: usize = 32;

enum VectorSink {
    Lance(LanceStore),
    Memory(MemoryStore),
}

pub struct CorpusBuilder {
    embedder: Arc<dyn EmbeddingModel>,
    vectors: VectorSink,
    text: TextIndexWriter,
    seen_ids: HashSet<String>,
}

/// Read-only handles over a finished corpus.
#[derive(Clone)]
pub struct SealedCorpus {
    pub vectors: Arc<dyn VectorIndex>,
    pub chunks: Arc<dyn ChunkStore>,
    pub text: Arc<TextSearch>,
}

impl CorpusBuilder {
    /// Build into `config.data_dir`, replacing any previous keyword index there.
    pub async fn on_disk(config: &RAGConfig, embedder: Arc<dyn EmbeddingModel>) -> Result<Self> {
        let lance = LanceStore::create(&config.lance_dir(), embedder.dimension()).await?;
        if lance.count().await? > 0 {
            return Err(anyhow!(
                "Chunk table in {} is not empty; ingestion expects a fresh data directory",
                config.lance_dir().display()
            ));
        }
        let text = TextIndexWriter::create(&config.text_index_dir())?;
        Ok(Self {
            embedder,
            vectors: VectorSink::Lance(lance),
            text,
            seen_ids: HashSet::new(),
        })
    }

    pub fn in_memory(embedder: Arc<dyn EmbeddingModel>) -> Result<Self> {
        let dimension = embedder.dimension();
        Ok(Self {
            embedder,
            vectors: VectorSink::Memory(MemoryStore::new(dimension)),
            text: TextIndexWriter::in_memory()?,
            seen_ids: HashSet::new(),
        })
    }

    /// Validate, embed and index a batch. Nothing is written if any chunk is invalid or
    /// any embedding has the wrong dimension.
    pub async fn add_chunks(&mut self, chunks: Vec<Chunk>) -> Result<usize> {
        let mut batch_ids = HashSet::new();
        for chunk in &chunks {
            validate_anchors(&chunk.id, &chunk.anchors)?;
            if self.seen_ids.contains(&chunk.id) || !batch_ids.insert(chunk.id.as_str()) {
                return Err(anyhow!("Duplicate chunk id {}", chunk.id));
            }
        }

        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH) {
            let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
            let embedded = self
                .embedder
                .embed_documents(&texts)
                .await
                .context("Failed to embed chunk batch")?;
            if embedded.len() != batch.len() {
                return Err(anyhow!(
                    "Embedder returned {} vectors for {} chunks",
                    embedded.len(),
                    batch.len()
                ));
            }
            vectors.extend(embedded);
        }
        let dimension = self.embedder.dimension();
        if let Some((chunk, vector)) = chunks
            .iter()
            .zip(&vectors)
            .find(|(_, v)| v.len() != dimension)
        {
            return Err(anyhow!(
                "Embedding for chunk {} has dimension {}, expected {}",
                chunk.id,
                vector.len(),
                dimension
            ));
        }

        // Vectors first: the keyword writer only buffers until `finish` commits it.
        let rows: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
            .collect();
        let count = rows.len();
        match &mut self.vectors {
            VectorSink::Lance(store) => store.insert_chunks(&rows).await?,
            VectorSink::Memory(store) => {
                for row in rows.iter().cloned() {
                    store.insert(row)?;
                }
            }
        }
        let chunks: Vec<Chunk> = rows.into_iter().map(|r| r.chunk).collect();
        self.text.add_chunks(&chunks)?;
        self.seen_ids.extend(chunks.into_iter().map(|c| c.id));

        tracing::debug!(count, total = self.seen_ids.len(), "Indexed chunk batch");
        Ok(count)
    }

    /// Commit both indexes and hand back read-only handles.
    pub async fn finish(self) -> Result<SealedCorpus> {
        let start = Instant::now();
        let total = self.seen_ids.len();
        let text = Arc::new(self.text.finish()?);

        let corpus = match self.vectors {
            VectorSink::Lance(store) => {
                store.create_index_if_needed().await?;
                let store = Arc::new(store);
                SealedCorpus {
                    vectors: store.clone(),
                    chunks: store,
                    text,
                }
            }
            VectorSink::Memory(store) => {
                let store = Arc::new(store);
                SealedCorpus {
                    vectors: store.clone(),
                    chunks: store,
                    text,
                }
            }
        };

        tracing::info!(
            chunks = total,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Corpus sealed"
        );
        Ok(corpus)
    }
}

impl SealedCorpus {
    /// Open a corpus previously written by [`CorpusBuilder::on_disk`].
    pub async fn open(config: &RAGConfig) -> Result<Self> {
        let store = Arc::new(LanceStore::open(&config.lance_dir(), config.embedding.dimension).await?);
        let text = Arc::new(TextSearch::open(&config.text_index_dir())?);
        Ok(Self {
            vectors: store.clone(),
            chunks: store,
            text,
        })
    }
}
