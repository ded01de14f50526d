//! In-process chunk store with exact cosine search. Suitable for small corpora and tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;

use super::{ChunkStore, EmbeddedChunk, VectorHit, VectorIndex};
use crate::anchors::MetadataFilter;
use crate::types::Chunk;

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Vec<EmbeddedChunk>,
    by_id: HashMap<String, usize>,
    dimension: usize,
}

impl MemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            rows: Vec::new(),
            by_id: HashMap::new(),
            dimension,
        }
    }

    pub(crate) fn insert(&mut self, row: EmbeddedChunk) -> Result<()> {
        if row.vector.len() != self.dimension {
            return Err(anyhow!(
                "Chunk {} has a {}-dim vector, store expects {}",
                row.chunk.id,
                row.vector.len(),
                self.dimension
            ));
        }
        if self.by_id.contains_key(&row.chunk.id) {
            return Err(anyhow!("Duplicate chunk id {}", row.chunk.id));
        }
        self.by_id.insert(row.chunk.id.clone(), self.rows.len());
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= 1e-12 || nb <= 1e-12 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorIndex for MemoryStore {
    async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorHit>> {
        if query.len() != self.dimension {
            return Err(anyhow!(
                "Query vector has {} dims, store expects {}",
                query.len(),
                self.dimension
            ));
        }

        let mut hits: Vec<VectorHit> = self
            .rows
            .iter()
            .filter(|r| filter.matches(&r.chunk.anchors))
            .map(|r| VectorHit {
                chunk: r.chunk.clone(),
                score: cosine(query, &r.vector),
            })
            .collect();
        // Stable: equal scores keep insertion order
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .map(|&i| self.rows[i].chunk.clone())
            .collect())
    }

    async fn list_chunks(&self, filter: &MetadataFilter, limit: usize) -> Result<Vec<Chunk>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| filter.matches(&r.chunk.anchors))
            .take(limit)
            .map(|r| r.chunk.clone())
            .collect())
    }

    async fn document_chars(&self, file_names: &[String]) -> Result<HashMap<String, usize>> {
        let mut totals = HashMap::new();
        for row in &self.rows {
            let file = &row.chunk.anchors.file_name;
            if file_names.iter().any(|f| f == file) {
                *totals.entry(file.clone()).or_insert(0) += row.chunk.char_len();
            }
        }
        Ok(totals)
    }
}
