//! OpenAI-compatible `/v1/embeddings` client with an LRU cache for query vectors.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::{normalize, EmbeddingModel};
use crate::config::EmbeddingConfig;

/// Inputs per request. The API accepts more, this keeps payloads small.
const MAX_BATCH: usize = 64;

pub struct ExternalEmbeddings {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    dimension: usize,
    cache: Option<Arc<RwLock<lru::LruCache<String, Vec<f32>>>>>,
}

impl ExternalEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        tracing::info!(
            endpoint = %config.endpoint,
            model = %config.model,
            dimension = config.dimension,
            "Creating embedding client"
        );

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            dimension: config.dimension,
            cache: NonZeroUsize::new(config.cache_size)
                .map(|cap| Arc::new(RwLock::new(lru::LruCache::new(cap)))),
        })
    }

    /// Cache key: the query text lowercased with whitespace collapsed.
    fn cache_key(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
    }

    async fn request(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "model": self.model,
            "input": inputs,
        });

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = builder
            .send()
            .await
            .with_context(|| format!("embedding request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(anyhow!("Embedding API error ({}): {}", status, error));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .context("embedding response was not valid JSON")?;
        parsed.data.sort_by_key(|d| d.index);

        if parsed.data.len() != inputs.len() {
            return Err(anyhow!(
                "Embedding API returned {} vectors for {} inputs",
                parsed.data.len(),
                inputs.len()
            ));
        }

        parsed
            .data
            .into_iter()
            .map(|d| {
                if d.embedding.len() != self.dimension {
                    Err(anyhow!(
                        "Embedding dimension mismatch: expected {}, got {}",
                        self.dimension,
                        d.embedding.len()
                    ))
                } else {
                    Ok(normalize(d.embedding))
                }
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingModel for ExternalEmbeddings {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let key = Self::cache_key(text);
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.write().get(&key) {
                return Ok(cached.clone());
            }
        }

        let embedding = self
            .request(&[text])
            .await?
            .pop()
            .ok_or_else(|| anyhow!("Embedding API returned no vector"))?;

        if let Some(cache) = &self.cache {
            cache.write().put(key, embedding.clone());
        }
        Ok(embedding)
    }

    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            out.extend(self.request(batch).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}
