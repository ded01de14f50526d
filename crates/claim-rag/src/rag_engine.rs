use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use crate::anchors::MetadataFilter;
use crate::config::{RAGConfig, RerankerKind};
use crate::embeddings::external::ExternalEmbeddings;
use crate::embeddings::EmbeddingModel;
use crate::error::{Degradation, RagError, RagResult};
use crate::indexing::SealedCorpus;
use crate::llm::LLMManager;
use crate::rag::{allocate, doc_total_chars, has_correlation_intent, QueryRouter};
use crate::reranking::{rerank_pool, CrossEncoderReranker, LlmReranker, Reranker};
use crate::search::{interleave_fusion, DenseRetriever, Retriever, SparseRetriever};
use crate::storage::ChunkStore;
use crate::tables::TableRegistry;
use crate::tools::{ToolInput, ToolSet};
use crate::types::{Answer, CandidateSource, RetrievalCandidate, RouteDecision, RouteMethod, Tool};

/// Upper bound on chunks scanned when linking tables to a filter.
const LINKAGE_SCAN_LIMIT: usize = 5_000;

/// Pre-built collaborators for [`RAGEngine::from_parts`].
pub struct EngineParts {
    pub corpus: SealedCorpus,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub llm: Arc<LLMManager>,
    pub reranker: Box<dyn Reranker>,
    pub tables: TableRegistry,
}

/// Query-time pipeline: route and retrieve concurrently, fuse, rerank, budget, dispatch.
pub struct RAGEngine {
    config: RAGConfig,
    dense: DenseRetriever,
    sparse: SparseRetriever,
    chunks: Arc<dyn ChunkStore>,
    reranker: Box<dyn Reranker>,
    router: QueryRouter,
    tables: TableRegistry,
    tools: ToolSet,
}

impl RAGEngine {
    /// Open the sealed corpus under `config.data_dir` and connect the external services.
    pub async fn new(config: RAGConfig) -> RagResult<Self> {
        config.validate().map_err(RagError::InvalidConfig)?;

        let corpus = SealedCorpus::open(&config)
            .await
            .map_err(|e| RagError::retrieval("corpus", format!("{:#}", e)))?;

        let embedder: Arc<dyn EmbeddingModel> = Arc::new(
            ExternalEmbeddings::new(&config.embedding)
                .map_err(|e| RagError::InvalidConfig(format!("embedding client: {:#}", e)))?,
        );

        let mut llm = LLMManager::new(config.llm.clone());
        llm.initialize()
            .await
            .map_err(|e| RagError::InvalidConfig(format!("LLM provider: {:#}", e)))?;
        let llm = Arc::new(llm);

        let reranker: Box<dyn Reranker> = match config.reranker.kind {
            RerankerKind::CrossEncoder => match CrossEncoderReranker::new(&config.model_dir()) {
                Ok(r) => Box::new(r),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Cross-encoder not available, using LLM reranker"
                    );
                    Box::new(LlmReranker::new(Arc::clone(&llm)))
                }
            },
            RerankerKind::Llm => Box::new(LlmReranker::new(Arc::clone(&llm))),
        };

        let tables = TableRegistry::load_or_empty(&config.registry_path())
            .map_err(|e| RagError::InvalidConfig(format!("{:#}", e)))?;

        Ok(Self::from_parts(
            config,
            EngineParts {
                corpus,
                embedder,
                llm,
                reranker,
                tables,
            },
        ))
    }

    pub fn from_parts(config: RAGConfig, parts: EngineParts) -> Self {
        let EngineParts {
            corpus,
            embedder,
            llm,
            reranker,
            tables,
        } = parts;

        tracing::info!(
            reranker = reranker.name(),
            tables = tables.len(),
            llm_enabled = llm.is_enabled(),
            "RAG engine ready"
        );

        Self {
            dense: DenseRetriever::new(corpus.vectors, embedder),
            sparse: SparseRetriever::new(corpus.text, Arc::clone(&corpus.chunks)),
            chunks: corpus.chunks,
            reranker,
            router: QueryRouter::new(Arc::clone(&llm), config.search.router_timeout()),
            tables,
            tools: ToolSet::new(llm),
            config,
        }
    }

    pub fn config(&self) -> &RAGConfig {
        &self.config
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    /// Answer `question` restricted to chunks whose anchors match every `metadata_filter` entry.
    pub async fn answer(
        &self,
        question: &str,
        metadata_filter: &HashMap<String, String>,
    ) -> RagResult<Answer> {
        let filter = MetadataFilter::from_map(metadata_filter)?;
        self.run(question, filter, None).await
    }

    /// Like [`RAGEngine::answer`] but skips classification and uses `tool`.
    pub async fn answer_with_tool(
        &self,
        question: &str,
        metadata_filter: &HashMap<String, String>,
        tool: Tool,
    ) -> RagResult<Answer> {
        let filter = MetadataFilter::from_map(metadata_filter)?;
        self.run(question, filter, Some(tool)).await
    }

    async fn run(
        &self,
        question: &str,
        filter: MetadataFilter,
        forced: Option<Tool>,
    ) -> RagResult<Answer> {
        let query_id = Uuid::new_v4();
        let span = tracing::info_span!("query", %query_id, forced = ?forced);
        self.run_pipeline(query_id, question, filter, forced)
            .instrument(span)
            .await
    }

    async fn run_pipeline(
        &self,
        query_id: Uuid,
        question: &str,
        filter: MetadataFilter,
        forced: Option<Tool>,
    ) -> RagResult<Answer> {
        let start = Instant::now();
        let search = &self.config.search;
        let retrieval_timeout = search.retrieval_timeout();

        let route_fut = async {
            match forced {
                Some(tool) => (
                    RouteDecision {
                        tool,
                        confidence: 1.0,
                        method: RouteMethod::Override,
                        correlation_intent: has_correlation_intent(question),
                    },
                    None,
                ),
                None => self.router.route(question).await,
            }
        };
        let dense_fut = tokio::time::timeout(
            retrieval_timeout,
            self.dense.retrieve(question, search.dense_top_k, &filter),
        );
        let sparse_fut = tokio::time::timeout(
            retrieval_timeout,
            self.sparse.retrieve(question, search.sparse_top_k, &filter),
        );

        let ((route, route_degradation), dense, sparse) =
            tokio::join!(route_fut, dense_fut, sparse_fut);
        let dense = retrieval_outcome(self.dense.source().backend(), dense, retrieval_timeout)?;
        let sparse = retrieval_outcome(self.sparse.source().backend(), sparse, retrieval_timeout)?;

        let mut degradations: Vec<Degradation> = route_degradation.into_iter().collect();

        tracing::info!(
            tool = %route.tool,
            method = ?route.method,
            dense_hits = dense.len(),
            sparse_hits = sparse.len(),
            "Retrieval and routing complete"
        );

        let pool = interleave_fusion(dense, sparse, search.candidate_pool);
        if pool.is_empty() {
            tracing::info!("No candidates matched, returning empty answer");
            return Ok(Answer {
                query_id,
                text: Answer::NO_RELEVANT_DOCUMENTS.to_string(),
                tool_used: route.tool,
                sources: Vec::new(),
                degraded: !degradations.is_empty(),
                degradations,
                route,
                citations: Vec::new(),
                correlation: None,
            });
        }

        let reranked = rerank_pool(
            self.reranker.as_ref(),
            question,
            pool,
            search.rerank_top_n,
            search.rerank_timeout(),
        )
        .await;
        degradations.extend(reranked.degradation);
        let ranked = reranked.results;
        tracing::debug!(
            kept = ranked.len(),
            from_both = ranked.iter().filter(|r| r.source == CandidateSource::Both).count(),
            "Reranked"
        );

        let files: Vec<String> = ranked
            .iter()
            .map(|r| r.chunk.anchors.file_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let doc_chars = self
            .chunks
            .document_chars(&files)
            .await
            .map_err(|e| RagError::retrieval("chunk_store", format!("{:#}", e)))?;
        let doc_total = doc_total_chars(&ranked, &doc_chars);
        let budget = allocate(ranked, doc_total, search.max_chunks, search.budget_fraction)?;

        let tables = match route.tool {
            Tool::TableQa | Tool::Statistics => {
                let matching = if filter.is_empty() {
                    Vec::new()
                } else {
                    self.chunks
                        .list_chunks(&filter, LINKAGE_SCAN_LIMIT)
                        .await
                        .map_err(|e| RagError::retrieval("chunk_store", format!("{:#}", e)))?
                };
                self.tables.resolve(&filter, &matching)?
            }
            Tool::Summary | Tool::Needle => Vec::new(),
        };

        let input = ToolInput {
            query: question,
            route: &route,
            budget: &budget,
            tables: &tables,
        };
        let generation_timeout = search.generation_timeout();
        let output = tokio::time::timeout(generation_timeout, self.tools.dispatch(route.tool, &input))
            .await
            .map_err(|_| {
                RagError::Generation(format!(
                    "{} timed out after {}ms",
                    route.tool,
                    generation_timeout.as_millis()
                ))
            })??;

        tracing::info!(
            tool_used = %output.tool_used,
            sources = output.sources.len(),
            budget_chunks = budget.len(),
            budget_chars = budget.total_chars,
            degraded = !degradations.is_empty(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Query answered"
        );

        Ok(Answer {
            query_id,
            text: output.text,
            tool_used: output.tool_used,
            sources: output.sources,
            degraded: !degradations.is_empty(),
            degradations,
            route,
            citations: output.citations,
            correlation: output.correlation,
        })
    }
}

fn retrieval_outcome(
    backend: &'static str,
    result: Result<anyhow::Result<Vec<RetrievalCandidate>>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> RagResult<Vec<RetrievalCandidate>> {
    match result {
        Ok(Ok(candidates)) => Ok(candidates),
        Ok(Err(e)) => {
            tracing::error!(backend, error = %e, "Retrieval failed");
            Err(RagError::retrieval(backend, format!("{:#}", e)))
        }
        Err(_) => {
            tracing::error!(backend, timeout_ms = timeout.as_millis() as u64, "Retrieval timed out");
            Err(RagError::retrieval(
                backend,
                format!("timed out after {}ms", timeout.as_millis()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{VectorHit, VectorIndex};
    use crate::test_support::{corpus, write_table_fixtures, HashEmbedder, ScriptedLlm};
    use crate::types::SourceRef;
    use async_trait::async_trait;

    async fn engine(llm: ScriptedLlm, dir: &std::path::Path) -> RAGEngine {
        engine_with(RAGConfig::default(), llm, dir, corpus().await)
    }

    fn engine_with(
        config: RAGConfig,
        llm: ScriptedLlm,
        dir: &std::path::Path,
        sealed: SealedCorpus,
    ) -> RAGEngine {
        let llm = llm.into_manager();
        let tables = TableRegistry::load(&write_table_fixtures(dir)).unwrap();
        RAGEngine::from_parts(
            config,
            EngineParts {
                corpus: sealed,
                embedder: Arc::new(HashEmbedder::default()),
                reranker: Box::new(LlmReranker::new(Arc::clone(&llm))),
                llm,
                tables,
            },
        )
    }

    fn filter(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_case_scoped_settlement_total_uses_case_tables_only() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new()
            .reply_when("query router", r#"{"tool":"table_qa","confidence":0.9}"#)
            .reply_when("search relevance judge", "[2, 1]");
        let engine = engine(llm, dir.path()).await;

        let answer = engine
            .answer(
                "How much was the total settlement for case CASE-103?",
                &filter(&[("CaseId", "103")]),
            )
            .await
            .unwrap();

        assert_eq!(answer.route.tool, Tool::TableQa);
        assert_eq!(answer.tool_used, Tool::TableQa);
        assert!(!answer.sources.is_empty());
        assert!(answer
            .sources
            .iter()
            .all(|s| matches!(s, SourceRef::Table(id) if id.starts_with("t_103_"))));
        assert!(answer.text.contains("$12,500.00"), "{}", answer.text);
        assert!(!answer.degraded);
    }

    #[tokio::test]
    async fn test_zero_match_filter_returns_no_documents_answer() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new().reply_when("query router", "TOOL: needle");
        let prompts = llm.prompts();
        let engine = engine(llm, dir.path()).await;

        let answer = engine
            .answer("What was the deductible?", &filter(&[("CaseId", "999")]))
            .await
            .unwrap();

        assert_eq!(answer.tool_used, Tool::Needle);
        assert!(answer.sources.is_empty());
        assert_eq!(answer.text, Answer::NO_RELEVANT_DOCUMENTS);
        // only the router was consulted
        assert_eq!(prompts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_forced_statistics_on_plain_question_has_no_correlation() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new().reply_when("search relevance judge", "[1, 2]");
        let engine = engine(llm, dir.path()).await;

        let answer = engine
            .answer_with_tool(
                "When was the collision reported?",
                &filter(&[("CaseId", "103")]),
                Tool::Statistics,
            )
            .await
            .unwrap();

        assert_eq!(answer.route.method, RouteMethod::Override);
        assert_eq!(answer.tool_used, Tool::Statistics);
        assert!(answer.correlation.is_none());
        assert!(answer.source_ids().iter().all(|id| id.starts_with("t_103_")));
    }

    #[tokio::test]
    async fn test_router_and_reranker_failures_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new()
            .fail_when("query router")
            .fail_when("search relevance judge")
            .otherwise("A burglary at the client warehouse was reported on 2024-05-02.");
        let engine = engine(llm, dir.path()).await;

        let answer = engine
            .answer("Describe what happened in case 104", &filter(&[("CaseId", "104")]))
            .await
            .unwrap();

        assert!(answer.degraded);
        assert_eq!(answer.route.method, RouteMethod::KeywordFallback);
        assert_eq!(answer.tool_used, Tool::Summary);
        assert!(answer
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::RouteFallback { .. })));
        assert!(answer
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::RerankDegraded { .. })));
        assert!(answer
            .citations
            .iter()
            .all(|a| a.case_id.as_deref() == Some("104")));
    }

    #[tokio::test]
    async fn test_unknown_filter_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(ScriptedLlm::new(), dir.path()).await;
        let err = engine
            .answer("anything", &filter(&[("Policy", "x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidFilter(_)));
    }

    struct UnreachableIndex;

    #[async_trait]
    impl VectorIndex for UnreachableIndex {
        async fn vector_search(
            &self,
            _query: &[f32],
            _k: usize,
            _filter: &MetadataFilter,
        ) -> anyhow::Result<Vec<VectorHit>> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_unreachable_vector_index_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sealed = corpus().await;
        sealed.vectors = Arc::new(UnreachableIndex);
        let engine = engine_with(RAGConfig::default(), ScriptedLlm::new(), dir.path(), sealed);

        let err = engine.answer("total settlement", &HashMap::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RagError::RetrievalUnavailable { backend: "vector", .. }
        ));
        assert!(err.is_fatal());
    }

    struct StalledIndex;

    #[async_trait]
    impl VectorIndex for StalledIndex {
        async fn vector_search(
            &self,
            _query: &[f32],
            _k: usize,
            _filter: &MetadataFilter,
        ) -> anyhow::Result<Vec<VectorHit>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_retrieval_timeout_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sealed = corpus().await;
        sealed.vectors = Arc::new(StalledIndex);
        let mut config = RAGConfig::default();
        config.search.retrieval_timeout_ms = 20;
        let llm = ScriptedLlm::new().reply_when("query router", "TOOL: summary");
        let engine = engine_with(config, llm, dir.path(), sealed);

        let err = engine
            .answer("Describe the collision", &filter(&[("CaseId", "103")]))
            .await
            .unwrap_err();
        match &err {
            RagError::RetrievalUnavailable { backend, reason } => {
                assert_eq!(*backend, "vector");
                assert!(reason.contains("timed out"), "{reason}");
            }
            other => panic!("expected RetrievalUnavailable, got {other:?}"),
        }
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_generation_timeout_surfaces_without_partial_answer() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RAGConfig::default();
        config.search.generation_timeout_ms = 20;
        let llm = ScriptedLlm::new()
            .reply_when("query router", "TOOL: summary")
            .reply_when("search relevance judge", "[1, 2, 3, 4]")
            .hang_when("You summarize excerpts");
        let engine = engine_with(config, llm, dir.path(), corpus().await);

        let err = engine
            .answer("Describe what happened in case 103", &filter(&[("CaseId", "103")]))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, RagError::Generation(msg) if msg.contains("timed out")),
            "{err:?}"
        );
    }
}
