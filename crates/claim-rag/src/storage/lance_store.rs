use anyhow::{anyhow, Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
    UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use chrono::NaiveDate;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::{ChunkStore, EmbeddedChunk, VectorHit, VectorIndex};
use crate::anchors::MetadataFilter;
use crate::types::{Anchors, Chunk};

const TABLE_NAME: &str = "chunks";
const SEED_ID: &str = "__seed__";

pub struct LanceStore {
    db: lancedb::Connection,
    dimension: usize,
    table_name: String,
}

impl LanceStore {
    /// Open or create the chunk table for ingestion.
    pub async fn create(path: &Path, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let store = Self::connect(path, dimension).await?;
        store.ensure_table().await?;
        Ok(store)
    }

    /// Open an existing corpus for querying. Fails if ingestion never ran.
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        let store = Self::connect(path, dimension).await?;
        let names = store.db.table_names().execute().await?;
        if !names.contains(&store.table_name) {
            return Err(anyhow!(
                "No chunk table in {}; run ingestion first",
                path.display()
            ));
        }
        Ok(store)
    }

    async fn connect(path: &Path, dimension: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| anyhow!("LanceDB path is not valid UTF-8: {}", path.display()))?;
        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self {
            db,
            dimension,
            table_name: TABLE_NAME.to_string(),
        })
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("char_count", DataType::UInt32, false),
            Field::new("file_name", DataType::Utf8, false),
            Field::new("page_number", DataType::UInt32, false),
            Field::new("section_type", DataType::Utf8, true),
            Field::new("table_id", DataType::Utf8, true),
            Field::new("figure_id", DataType::Utf8, true),
            Field::new("incident_date", DataType::Utf8, true),
            Field::new("incident_type", DataType::Utf8, true),
            Field::new("client_id", DataType::Utf8, true),
            Field::new("case_id", DataType::Utf8, true),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
        ]))
    }

    fn build_batch(&self, rows: &[EmbeddedChunk]) -> Result<RecordBatch> {
        for row in rows {
            if row.vector.len() != self.dimension {
                return Err(anyhow!(
                    "Chunk {} has a {}-dim vector, index expects {}",
                    row.chunk.id,
                    row.vector.len(),
                    self.dimension
                ));
            }
        }

        let anchors: Vec<&Anchors> = rows.iter().map(|r| &r.chunk.anchors).collect();
        let opt = |f: fn(&Anchors) -> Option<String>| -> StringArray {
            anchors.iter().map(|a| f(a)).collect::<Vec<_>>().into()
        };

        let flat_vectors: Vec<f32> = rows.iter().flat_map(|r| r.vector.iter().copied()).collect();
        let vector_array = FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.dimension as i32,
            Arc::new(Float32Array::from(flat_vectors)) as Arc<dyn Array>,
            None,
        );

        RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(StringArray::from(
                    rows.iter().map(|r| r.chunk.id.as_str()).collect::<Vec<_>>(),
                )) as Arc<dyn Array>,
                Arc::new(StringArray::from(
                    rows.iter().map(|r| r.chunk.text.as_str()).collect::<Vec<_>>(),
                )),
                Arc::new(UInt32Array::from(
                    rows.iter()
                        .map(|r| r.chunk.char_len() as u32)
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    anchors.iter().map(|a| a.file_name.as_str()).collect::<Vec<_>>(),
                )),
                Arc::new(UInt32Array::from(
                    anchors.iter().map(|a| a.page_number).collect::<Vec<_>>(),
                )),
                Arc::new(opt(|a| a.section_type.map(|s| s.as_str().to_string()))),
                Arc::new(opt(|a| a.table_id.clone())),
                Arc::new(opt(|a| a.figure_id.clone())),
                Arc::new(opt(|a| {
                    a.incident_date.map(|d| d.format("%Y-%m-%d").to_string())
                })),
                Arc::new(opt(|a| a.incident_type.map(|t| t.as_str().to_string()))),
                Arc::new(opt(|a| a.client_id.clone())),
                Arc::new(opt(|a| a.case_id.clone())),
                Arc::new(vector_array) as Arc<dyn Array>,
            ],
        )
        .context("Failed to create RecordBatch")
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if !names.contains(&self.table_name) {
            // Create with a single seed record, then delete it
            let seed = EmbeddedChunk {
                chunk: Chunk::new(
                    SEED_ID,
                    "",
                    Anchors::new(SEED_ID, 1, crate::types::SectionType::Body),
                ),
                vector: vec![0.0f32; self.dimension],
            };
            let batch = self.build_batch(std::slice::from_ref(&seed))?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], self.schema());
            self.db
                .create_table(&self.table_name, Box::new(batches))
                .execute()
                .await
                .context("Failed to create chunks table")?;

            let table = self.db.open_table(&self.table_name).execute().await?;
            table
                .delete(&format!("id = '{}'", SEED_ID))
                .await
                .context("Failed to remove seed record")?;
        }
        Ok(())
    }

    pub(crate) async fn insert_chunks(&self, rows: &[EmbeddedChunk]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let table = self
            .db
            .open_table(&self.table_name)
            .execute()
            .await
            .context("Failed to open chunks table")?;

        let batch = self.build_batch(rows)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], self.schema());
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("Failed to insert chunks")?;

        tracing::debug!(count = rows.len(), "Inserted chunks into LanceDB");
        Ok(())
    }

    pub(crate) async fn create_index_if_needed(&self) -> Result<()> {
        let count = self.count().await?;
        if count >= 1_000 {
            let table = self.db.open_table(&self.table_name).execute().await?;
            table
                .create_index(&["vector"], lancedb::index::Index::Auto)
                .execute()
                .await
                .context("Failed to create vector index")?;
            tracing::info!(rows = count, "Created ANN index on chunk vectors");
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        Ok(table.count_rows(None).await?)
    }

    async fn query_rows(&self, predicate: Option<String>, limit: Option<usize>) -> Result<Vec<Chunk>> {
        let table = self.db.open_table(&self.table_name).execute().await?;

        let mut query = table.query();
        if let Some(pred) = predicate {
            query = query.only_if(pred);
        }
        if let Some(limit) = limit {
            query = query.limit(limit);
        }

        let results = query.execute().await.context("LanceDB query failed")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(extract_chunks_from_batches(&batches)
            .into_iter()
            .map(|(chunk, _)| chunk)
            .collect())
    }
}

#[async_trait]
impl VectorIndex for LanceStore {
    async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorHit>> {
        let table = self.db.open_table(&self.table_name).execute().await?;

        let mut query_builder = table
            .query()
            .nearest_to(query)?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k);

        if let Some(predicate) = filter.to_lance_predicate() {
            query_builder = query_builder.only_if(predicate);
        }

        let results = query_builder
            .execute()
            .await
            .context("LanceDB vector search failed")?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(extract_chunks_from_batches(&batches)
            .into_iter()
            .map(|(chunk, distance)| VectorHit {
                chunk,
                score: distance.map(|d| 1.0 - d).unwrap_or(0.0),
            })
            .collect())
    }
}

#[async_trait]
impl ChunkStore for LanceStore {
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let mut all = Vec::with_capacity(ids.len());
        // Query in batches to avoid overly long SQL predicates
        for batch in ids.chunks(50) {
            let id_list: Vec<String> = batch
                .iter()
                .map(|id| format!("'{}'", id.replace('\'', "''")))
                .collect();
            let predicate = format!("id IN ({})", id_list.join(", "));
            all.extend(self.query_rows(Some(predicate), None).await?);
        }
        Ok(all)
    }

    async fn list_chunks(&self, filter: &MetadataFilter, limit: usize) -> Result<Vec<Chunk>> {
        self.query_rows(filter.to_lance_predicate(), Some(limit)).await
    }

    async fn document_chars(&self, file_names: &[String]) -> Result<HashMap<String, usize>> {
        let mut totals = HashMap::new();
        if file_names.is_empty() {
            return Ok(totals);
        }

        let table = self.db.open_table(&self.table_name).execute().await?;
        let names: Vec<String> = file_names
            .iter()
            .map(|f| format!("'{}'", f.replace('\'', "''")))
            .collect();
        let results = table
            .query()
            .only_if(format!("file_name IN ({})", names.join(", ")))
            .select(lancedb::query::Select::columns(&["file_name", "char_count"]))
            .execute()
            .await
            .context("Failed to query document sizes")?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        for batch in &batches {
            let files = batch
                .column_by_name("file_name")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let counts = batch
                .column_by_name("char_count")
                .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
            let (Some(files), Some(counts)) = (files, counts) else {
                continue;
            };
            for i in 0..batch.num_rows() {
                *totals.entry(files.value(i).to_string()).or_insert(0) += counts.value(i) as usize;
            }
        }
        Ok(totals)
    }
}

/// Rebuild chunks (and the `_distance` column when present) from Arrow batches.
/// Rows whose anchor columns fail to parse are skipped with a warning.
fn extract_chunks_from_batches(batches: &[RecordBatch]) -> Vec<(Chunk, Option<f32>)> {
    fn strings<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    }
    fn nullable(col: Option<&StringArray>, i: usize) -> Option<String> {
        col.filter(|c| !c.is_null(i)).map(|c| c.value(i).to_string())
    }

    let mut out = Vec::new();
    for batch in batches {
        let ids = strings(batch, "id");
        let texts = strings(batch, "text");
        let files = strings(batch, "file_name");
        let pages = batch
            .column_by_name("page_number")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let sections = strings(batch, "section_type");
        let tables = strings(batch, "table_id");
        let figures = strings(batch, "figure_id");
        let dates = strings(batch, "incident_date");
        let incidents = strings(batch, "incident_type");
        let clients = strings(batch, "client_id");
        let cases = strings(batch, "case_id");
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(ids), Some(texts), Some(files), Some(pages)) = (ids, texts, files, pages) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            let id = ids.value(i).to_string();
            let parsed = (|| -> Result<Anchors, String> {
                Ok(Anchors {
                    file_name: files.value(i).to_string(),
                    page_number: pages.value(i),
                    section_type: nullable(sections, i).map(|s| s.parse()).transpose()?,
                    table_id: nullable(tables, i),
                    figure_id: nullable(figures, i),
                    incident_date: nullable(dates, i)
                        .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
                        .transpose()
                        .map_err(|e| e.to_string())?,
                    incident_type: nullable(incidents, i).map(|t| t.parse()).transpose()?,
                    client_id: nullable(clients, i),
                    case_id: nullable(cases, i),
                })
            })();

            match parsed {
                Ok(anchors) => out.push((
                    Chunk::new(id, texts.value(i), anchors),
                    distances.map(|d| d.value(i)),
                )),
                Err(e) => tracing::warn!(chunk_id = %id, error = %e, "Skipping row with malformed anchors"),
            }
        }
    }
    out
}
