use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;

use super::Reranker;
use crate::types::FusedCandidate;

const PAIRS_PER_RUN: usize = 16;
const MAX_SEQUENCE: usize = 512;
/// Checked in order; the O4-optimised export wins when both exist.
const MODEL_FILES: [&str; 2] = ["model_O4.onnx", "model.onnx"];

/// Files making up an exported cross-encoder.
#[derive(Debug)]
struct ModelFiles {
    model: PathBuf,
    tokenizer: PathBuf,
}

impl ModelFiles {
    fn locate(model_dir: &Path) -> Result<Self> {
        let model = MODEL_FILES
            .iter()
            .map(|name| model_dir.join(name))
            .find(|p| p.exists())
            .ok_or_else(|| anyhow!("No reranker model found in: {}", model_dir.display()))?;
        let tokenizer = model_dir.join("tokenizer.json");
        if !tokenizer.exists() {
            bail!("Tokenizer not found at: {}", tokenizer.display());
        }
        Ok(Self { model, tokenizer })
    }
}

/// Row-major `[rows, width]` input tensors, zero padded.
#[derive(Debug, Default, PartialEq)]
struct PairBatch {
    rows: usize,
    width: usize,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    token_type_ids: Vec<i64>,
}

impl PairBatch {
    /// Each item is `(ids, mask, type_ids)` for one (question, passage) pair.
    fn pack(items: &[(&[u32], &[u32], &[u32])], max_len: usize) -> Self {
        let width = items
            .iter()
            .map(|(ids, _, _)| ids.len().min(max_len))
            .max()
            .unwrap_or(0)
            .max(1);
        let mut batch = Self {
            rows: items.len(),
            width,
            input_ids: Vec::with_capacity(items.len() * width),
            attention_mask: Vec::with_capacity(items.len() * width),
            token_type_ids: Vec::with_capacity(items.len() * width),
        };
        for (ids, mask, types) in items {
            let len = ids.len().min(width);
            batch.input_ids.extend(ids[..len].iter().map(|&v| v as i64));
            batch.attention_mask.extend(mask[..len].iter().map(|&v| v as i64));
            batch.token_type_ids.extend(types[..len].iter().map(|&v| v as i64));
            let pad = width - len;
            batch.input_ids.extend(std::iter::repeat(0).take(pad));
            batch.attention_mask.extend(std::iter::repeat(0).take(pad));
            batch.token_type_ids.extend(std::iter::repeat(0).take(pad));
        }
        batch
    }
}

/// Relevance logit per row. Two-class heads report the positive class in the last column.
fn relevance_logits(data: &[f32], rows: usize) -> Result<Vec<f32>> {
    if rows == 0 || data.is_empty() || data.len() % rows != 0 {
        bail!("Cross-encoder produced {} logits for {} pairs", data.len(), rows);
    }
    let cols = data.len() / rows;
    Ok(data.chunks(cols).map(|row| row[cols - 1]).collect())
}

/// ONNX cross-encoder (ms-marco-MiniLM style) reading question and passage together.
#[derive(Clone)]
pub struct CrossEncoderReranker {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
    max_length: usize,
}

impl CrossEncoderReranker {
    pub fn new(model_dir: &Path) -> Result<Self> {
        let files = ModelFiles::locate(model_dir)?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let model_bytes = std::fs::read(&files.model)
            .with_context(|| format!("Failed to read {}", files.model.display()))?;
        let session = Session::builder()
            .map_err(|e| anyhow!("Session builder: {}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("Optimization level: {}", e))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| anyhow!("Failed to load reranker model {}: {}", files.model.display(), e))?;

        tracing::info!(model = %files.model.display(), "Cross-encoder reranker loaded");

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            max_length: MAX_SEQUENCE,
        })
    }

    /// Scores aligned with `passages`. Passages that fail to tokenize score `-inf`.
    fn score_passages(&self, question: &str, passages: &[String]) -> Result<Vec<f32>> {
        let mut scores = vec![f32::NEG_INFINITY; passages.len()];

        for (run, group) in passages.chunks(PAIRS_PER_RUN).enumerate() {
            let offset = run * PAIRS_PER_RUN;
            let mut positions = Vec::with_capacity(group.len());
            let mut encodings = Vec::with_capacity(group.len());
            for (i, passage) in group.iter().enumerate() {
                match self.tokenizer.encode((question, passage.as_str()), true) {
                    Ok(enc) => {
                        positions.push(offset + i);
                        encodings.push(enc);
                    }
                    Err(e) => tracing::warn!(position = offset + i, error = %e, "Cross-encoder tokenization failed"),
                }
            }
            if encodings.is_empty() {
                continue;
            }

            let items: Vec<(&[u32], &[u32], &[u32])> = encodings
                .iter()
                .map(|e| (e.get_ids(), e.get_attention_mask(), e.get_type_ids()))
                .collect();
            let batch = PairBatch::pack(&items, self.max_length);
            let logits = self.run(batch)?;
            for (pos, logit) in positions.into_iter().zip(logits) {
                scores[pos] = logit;
            }
        }

        Ok(scores)
    }

    fn run(&self, batch: PairBatch) -> Result<Vec<f32>> {
        let shape = vec![batch.rows, batch.width];
        let tensor = |name: &str, data: Vec<i64>| {
            Value::from_array((shape.clone(), data)).map_err(|e| anyhow!("{} tensor: {}", name, e))
        };
        let inputs = ort::inputs![
            "input_ids" => tensor("input_ids", batch.input_ids)?,
            "attention_mask" => tensor("attention_mask", batch.attention_mask)?,
            "token_type_ids" => tensor("token_type_ids", batch.token_type_ids)?,
        ];

        let mut session = self.session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| anyhow!("Cross-encoder inference failed: {}", e))?;
        let logits_name = outputs
            .iter()
            .next()
            .map(|(name, _)| name.to_string())
            .ok_or_else(|| anyhow!("Cross-encoder produced no outputs"))?;
        let (_shape, data) = outputs[logits_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("Failed to read cross-encoder logits: {}", e))?;
        relevance_logits(data, batch.rows)
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &'static str {
        "cross_encoder"
    }

    async fn score(&self, query: &str, candidates: &[FusedCandidate]) -> Result<Vec<f32>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let this = self.clone();
        let question = query.to_string();
        let passages: Vec<String> = candidates.iter().map(|c| c.chunk.text.clone()).collect();
        tokio::task::spawn_blocking(move || this.score_passages(&question, &passages))
            .await
            .context("Cross-encoder task panicked")?
    }
}
