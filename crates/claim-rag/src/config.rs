use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::{ApiProvider, LLMConfig, LLMMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RAGConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub reranker: RerankerConfig,
    pub llm: LLMConfig,
    pub tables: TableConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible embeddings endpoint.
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub dimension: usize,
    /// Capacity of the query-embedding LRU cache. 0 disables it.
    pub cache_size: usize,
}

/// Retrieval, fusion and budget policy. Timeouts are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub dense_top_k: usize,
    pub sparse_top_k: usize,
    pub candidate_pool: usize,
    pub rerank_top_n: usize,
    pub max_chunks: usize,
    pub budget_fraction: f64,
    #[serde(alias = "router_timeout")]
    pub router_timeout_ms: u64,
    #[serde(alias = "rerank_timeout")]
    pub rerank_timeout_ms: u64,
    #[serde(alias = "retrieval_timeout")]
    pub retrieval_timeout_ms: u64,
    #[serde(alias = "generation_timeout")]
    pub generation_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankerKind {
    /// Listwise relevance judgment by the configured LLM.
    Llm,
    /// ONNX cross-encoder (ms-marco MiniLM) under `model_dir`.
    CrossEncoder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RerankerConfig {
    pub kind: RerankerKind,
    /// Defaults to `<data_dir>/models`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableConfig {
    /// Path of `registry.json`, by default `<data_dir>/tables/registry.json`. Relative CSV
    /// paths inside it resolve against its directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
}

impl SearchConfig {
    pub fn router_timeout(&self) -> Duration {
        Duration::from_millis(self.router_timeout_ms)
    }

    pub fn rerank_timeout(&self) -> Duration {
        Duration::from_millis(self.rerank_timeout_ms)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dense_top_k: 10,
            sparse_top_k: 10,
            candidate_pool: 40,
            rerank_top_n: 8,
            max_chunks: 10,
            budget_fraction: 0.05,
            router_timeout_ms: 10_000,
            rerank_timeout_ms: 20_000,
            retrieval_timeout_ms: 30_000,
            generation_timeout_ms: 120_000,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: String::new(),
            dimension: 1536,
            cache_size: 1000,
        }
    }
}

impl Default for RAGConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("claim-rag"),
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            reranker: RerankerConfig::default(),
            llm: LLMConfig::default(),
            tables: TableConfig::default(),
        }
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            kind: RerankerKind::Llm,
            model_dir: None,
        }
    }
}

impl RAGConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        let s = &self.search;
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if s.dense_top_k == 0 || s.sparse_top_k == 0 {
            return Err("search.dense_top_k and search.sparse_top_k must be > 0".into());
        }
        if s.candidate_pool == 0 {
            return Err("search.candidate_pool must be > 0".into());
        }
        if s.rerank_top_n == 0 {
            return Err("search.rerank_top_n must be > 0".into());
        }
        if s.max_chunks == 0 {
            return Err("search.max_chunks must be > 0".into());
        }
        if !(s.budget_fraction > 0.0 && s.budget_fraction <= 1.0) {
            return Err("search.budget_fraction must be in (0.0, 1.0]".into());
        }
        if s.router_timeout_ms == 0
            || s.rerank_timeout_ms == 0
            || s.retrieval_timeout_ms == 0
            || s.generation_timeout_ms == 0
        {
            return Err("search timeouts must be > 0 ms".into());
        }
        if self.llm.max_tokens == 0 {
            return Err("llm.max_tokens must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    /// Unknown keys are rejected.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `OPENAI_API_KEY`, `OPENAI_CHAT_MODEL`, `OPENAI_EMBED_MODEL` and `CLAIM_RAG_DATA_DIR`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = non_empty("CLAIM_RAG_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(model) = non_empty("OPENAI_EMBED_MODEL") {
            self.embedding.model = model;
        }

        let api_key = non_empty("OPENAI_API_KEY");
        if let Some(ref key) = api_key {
            if self.embedding.api_key.is_empty() {
                self.embedding.api_key = key.clone();
            }
        }

        let chat_model = non_empty("OPENAI_CHAT_MODEL");
        if let LLMMode::External { api_key: existing, model, .. } = &mut self.llm.mode {
            if existing.is_empty() {
                if let Some(key) = api_key {
                    *existing = key;
                }
            }
            if let Some(m) = chat_model {
                *model = m;
            }
        } else if let Some(key) = api_key {
            self.llm.mode = LLMMode::External {
                provider: ApiProvider::OpenAI,
                api_key: key,
                model: chat_model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            };
        }
    }

    pub fn lance_dir(&self) -> PathBuf {
        self.data_dir.join("lance")
    }

    pub fn text_index_dir(&self) -> PathBuf {
        self.data_dir.join("tantivy")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.tables
            .registry_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("tables").join("registry.json"))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.reranker
            .model_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_pipeline_policy() {
        let config = RAGConfig::default();
        assert_eq!(config.search.dense_top_k, 10);
        assert_eq!(config.search.sparse_top_k, 10);
        assert_eq!(config.search.candidate_pool, 40);
        assert_eq!(config.search.rerank_top_n, 8);
        assert_eq!(config.search.max_chunks, 10);
        assert!((config.search.budget_fraction - 0.05).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let mut config = RAGConfig::default();
        config.search.budget_fraction = 0.0;
        assert!(config.validate().is_err());

        let mut config = RAGConfig::default();
        config.search.max_chunks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_accepts_timeout_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"search": {"router_timeout": 250, "rerank_top_n": 5}}"#,
        )
        .unwrap();

        let config = RAGConfig::from_file(&path).unwrap();
        assert_eq!(config.search.router_timeout(), Duration::from_millis(250));
        assert_eq!(config.search.rerank_top_n, 5);
        assert_eq!(config.search.candidate_pool, 40);
    }

    #[test]
    fn test_from_file_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"search": {"hybrid_alpha": 0.7}}"#).unwrap();

        let err = RAGConfig::from_file(&path).unwrap_err();
        assert!(err.contains("hybrid_alpha"), "{err}");
    }

    #[test]
    fn test_paths_follow_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"data_dir": "/srv/claims"}"#).unwrap();

        let config = RAGConfig::from_file(&path).unwrap();
        assert_eq!(config.registry_path(), PathBuf::from("/srv/claims/tables/registry.json"));
        assert_eq!(config.model_dir(), PathBuf::from("/srv/claims/models"));
        assert_eq!(config.lance_dir(), PathBuf::from("/srv/claims/lance"));
    }

    #[test]
    fn test_explicit_paths_survive_data_dir_override() {
        let mut config: RAGConfig = serde_json::from_str(
            r#"{"tables": {"registry_path": "/opt/registry.json"}, "reranker": {"kind": "cross_encoder"}}"#,
        )
        .unwrap();
        config.apply_overrides(|k| (k == "CLAIM_RAG_DATA_DIR").then(|| "/data".to_string()));

        assert_eq!(config.registry_path(), PathBuf::from("/opt/registry.json"));
        assert_eq!(config.model_dir(), PathBuf::from("/data/models"));
        assert_eq!(config.reranker.kind, RerankerKind::CrossEncoder);
    }

    #[test]
    fn test_env_overrides_enable_external_llm() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_CHAT_MODEL", "gpt-4o"),
            ("OPENAI_EMBED_MODEL", "text-embedding-3-large"),
        ]
        .into_iter()
        .collect();

        let mut config = RAGConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.embedding.model, "text-embedding-3-large");
        assert_eq!(config.embedding.api_key, "sk-test");
        match config.llm.mode {
            LLMMode::External { api_key, model, .. } => {
                assert_eq!(api_key, "sk-test");
                assert_eq!(model, "gpt-4o");
            }
            other => panic!("expected external mode, got {other:?}"),
        }
    }
}
