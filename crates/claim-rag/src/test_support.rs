//! Shared fixtures for unit tests: a scripted LLM, a deterministic embedder and a small
//! two-case insurance corpus with its table registry.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::embeddings::{normalize, EmbeddingModel};
use crate::indexing::{CorpusBuilder, SealedCorpus};
use crate::llm::{GenerationConfig, LLMConfig, LLMManager, LLMProvider, ProviderInfo};
use crate::types::{
    Anchors, BudgetedSet, CandidateSource, Chunk, IncidentType, RankedResult, SectionType,
};

#[derive(Clone)]
enum Behavior {
    Reply(String),
    Fail(String),
    Hang,
}

/// LLM double: the first rule whose needle occurs in the prompt decides the response.
#[derive(Clone)]
pub struct ScriptedLlm {
    rules: Vec<(String, Behavior)>,
    fallback: Behavior,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: Behavior::Fail("no scripted reply".into()),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn reply_when(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push((needle.into(), Behavior::Reply(reply.into())));
        self
    }

    pub fn fail_when(mut self, needle: &str) -> Self {
        self.rules.push((needle.into(), Behavior::Fail(format!("scripted failure on '{needle}'"))));
        self
    }

    pub fn hang_when(mut self, needle: &str) -> Self {
        self.rules.push((needle.into(), Behavior::Hang));
        self
    }

    pub fn otherwise(mut self, reply: &str) -> Self {
        self.fallback = Behavior::Reply(reply.into());
        self
    }

    /// Handle onto every prompt received, in order.
    pub fn prompts(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }

    pub fn into_manager(self) -> Arc<LLMManager> {
        Arc::new(LLMManager::with_provider(LLMConfig::default(), Box::new(self)))
    }
}

#[async_trait]
impl LLMProvider for ScriptedLlm {
    async fn generate(&self, prompt: &str, _config: &GenerationConfig) -> Result<String> {
        self.prompts.lock().push(prompt.to_string());
        let behavior = self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, b)| b.clone())
            .unwrap_or_else(|| self.fallback.clone());
        match behavior {
            Behavior::Reply(text) => Ok(text),
            Behavior::Fail(msg) => Err(anyhow!(msg)),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(anyhow!("unreachable"))
            }
        }
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "scripted".into(),
            model: "scripted".into(),
            is_local: true,
        }
    }
}

/// Bag-of-words hashing embedder. Texts sharing words land close together.
pub struct HashEmbedder {
    dimension: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dimension: 64 }
    }
}

impl HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
        {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() as usize) % self.dimension] += 1.0;
        }
        normalize(v)
    }
}

#[async_trait]
impl EmbeddingModel for HashEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn anchors(
    case: &str,
    client: &str,
    page: u32,
    section: SectionType,
    incident: IncidentType,
    date: (i32, u32, u32),
) -> Anchors {
    let mut a = Anchors::new(format!("case_{case}_claim.pdf"), page, section);
    a.case_id = Some(case.into());
    a.client_id = Some(client.into());
    a.incident_type = Some(incident);
    a.incident_date = NaiveDate::from_ymd_opt(date.0, date.1, date.2);
    a
}

/// Two claim files: case 103 (collision) and case 104 (burglary).
pub fn fixture_chunks() -> Vec<Chunk> {
    let c103 = |page, section| anchors("103", "C-201", page, section, IncidentType::Collision, (2024, 3, 14));
    let c104 = |page, section| anchors("104", "C-305", page, section, IncidentType::Burglary, (2024, 5, 2));

    let mut payments_103 = c103(3, SectionType::Table);
    payments_103.table_id = Some("t_103_payments".into());
    let mut payments_104 = c104(2, SectionType::Table);
    payments_104.table_id = Some("t_104_payments".into());
    let mut figure_104 = c104(3, SectionType::Figure);
    figure_104.figure_id = Some("fig_104_1".into());

    vec![
        Chunk::new(
            "c103-summary",
            "Claim summary for case 103. Client Dana Reyes reported a rear-end collision on \
             2024-03-14. The insurer accepted liability and settled the claim.",
            c103(1, SectionType::Summary),
        ),
        Chunk::new(
            "c103-timeline",
            "Timeline: 2024-03-14 collision reported. 2024-03-20 adjuster inspection. \
             2024-04-02 settlement payment issued to the client.",
            c103(2, SectionType::Timeline),
        ),
        Chunk::new(
            "c103-payments",
            "Payment table: Date, Description, Amount. Deductible 500. Settlement payment \
             12,000. Total settlement 12,500.",
            payments_103,
        ),
        Chunk::new(
            "c103-policy",
            "Policy terms: the collision deductible is 500 dollars and the coverage limit is \
             50,000 dollars per incident. Exactly 20 percent of towing costs are reimbursed.",
            c103(4, SectionType::Body),
        ),
        Chunk::new(
            "c104-summary",
            "Claim summary for case 104. A burglary at the client warehouse was reported on \
             2024-05-02. Stolen inventory was documented by the adjuster.",
            c104(1, SectionType::Summary),
        ),
        Chunk::new(
            "c104-payments",
            "Payment table for case 104: Date, Description, Amount. Settlement payment 8,000. \
             Total settlement 8,000.",
            payments_104,
        ),
        Chunk::new(
            "c104-figure",
            "Figure 1 shows the warehouse floor plan with the forced entry point.",
            figure_104,
        ),
    ]
}

/// Budgeted set holding the named fixture chunks in the given order.
pub fn budget_of(ids: &[&str]) -> BudgetedSet {
    let all = fixture_chunks();
    let chunks: Vec<RankedResult> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| RankedResult {
            chunk: Arc::new(all.iter().find(|c| c.id == *id).unwrap().clone()),
            fused_rank: i,
            source: CandidateSource::Both,
            rerank_score: None,
        })
        .collect();
    let total_chars = chunks.iter().map(|r| r.chunk.char_len()).sum();
    BudgetedSet {
        chunks,
        total_chars,
        doc_total_chars: total_chars * 20,
    }
}

pub async fn corpus() -> SealedCorpus {
    let mut builder = CorpusBuilder::in_memory(Arc::new(HashEmbedder::default())).unwrap();
    builder.add_chunks(fixture_chunks()).await.unwrap();
    builder.finish().await.unwrap()
}

/// Write `registry.json` plus CSVs for both cases into `dir`. Returns the registry path.
pub fn write_table_fixtures(dir: &Path) -> std::path::PathBuf {
    std::fs::write(
        dir.join("t_103_payments.csv"),
        "Date,Description,Amount\n\
         2024-03-20,Deductible,$500.00\n\
         2024-04-02,Settlement payment,\"$12,000.00\"\n\
         ,Total,\"$12,500.00\"\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("t_103_repairs.csv"),
        "Item,Labor Hours,Cost\n\
         Bumper,4,1200\n\
         Tail light,1,300\n\
         Trunk lid,6,2100\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("t_104_payments.csv"),
        "Date,Description,Amount\n\
         2024-05-20,Settlement payment,8000\n\
         ,Total,8000\n",
    )
    .unwrap();

    let registry = serde_json::json!({
        "t_103_payments": {
            "table_id": "t_103_payments",
            "page": 3,
            "csv": "t_103_payments.csv",
            "file_name": "case_103_claim.pdf",
            "method": "camelot",
            "summary": "Payments issued for claim 103 including settlement total",
            "case_id": "103"
        },
        "t_103_repairs": {
            "table_id": "t_103_repairs",
            "page": 5,
            "csv": "t_103_repairs.csv",
            "file_name": "case_103_claim.pdf",
            "method": "camelot",
            "summary": "Repair estimate line items"
        },
        "t_104_payments": {
            "table_id": "t_104_payments",
            "page": 2,
            "csv": "t_104_payments.csv",
            "file_name": "case_104_claim.pdf",
            "method": "camelot",
            "summary": "Payments issued for claim 104",
            "case_id": "104"
        }
    });
    let path = dir.join("registry.json");
    std::fs::write(&path, serde_json::to_string_pretty(&registry).unwrap()).unwrap();
    path
}
