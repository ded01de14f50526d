use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, ConstScoreQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    self, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value as TantivyValue,
    STORED, STRING,
};
use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, StopWordFilter, TextAnalyzer};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use crate::anchors::{FilterCondition, MetadataFilter};
use crate::types::Chunk;

const TOKENIZER: &str = "claim_text";

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "in", "is", "it",
    "its", "of", "on", "that", "the", "to", "was", "were", "will", "with", "or", "this", "these",
    "there", "then", "than", "so", "if", "when", "where", "how", "what", "which", "who", "do",
    "does", "did", "have", "had", "much", "many",
];

/// Field handles shared by the writer and the reader.
#[derive(Clone, Copy)]
struct Fields {
    id: schema::Field,
    text: schema::Field,
}

/// Anchor columns indexed as raw (untokenized) strings for exact filtering.
const ANCHOR_FIELDS: [&str; 9] = [
    "file_name",
    "page_number",
    "section_type",
    "table_id",
    "figure_id",
    "incident_date",
    "incident_type",
    "client_id",
    "case_id",
];

/// Build the canonical schema. `id` must be STRING (indexed, not tokenized)
/// so `TermQuery` lookups work.
fn build_schema() -> (Schema, Fields) {
    let mut sb = Schema::builder();
    let id = sb.add_text_field("id", STRING | STORED);
    let text_indexing = TextFieldIndexing::default()
        .set_tokenizer(TOKENIZER)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let text = sb.add_text_field(
        "text",
        TextOptions::default().set_indexing_options(text_indexing),
    );
    for name in ANCHOR_FIELDS {
        sb.add_text_field(name, STRING);
    }
    (sb.build(), Fields { id, text })
}

fn register_tokenizer(index: &Index) {
    let tokenizer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(StopWordFilter::remove(
            STOP_WORDS.iter().map(|s| s.to_string()),
        ))
        .build();
    index.tokenizers().register(TOKENIZER, tokenizer);
}

fn anchor_values(chunk: &Chunk) -> Vec<(&'static str, String)> {
    let a = &chunk.anchors;
    let mut values = vec![
        ("file_name", a.file_name.clone()),
        ("page_number", a.page_number.to_string()),
    ];
    let conditions = [
        a.section_type.map(FilterCondition::SectionType),
        a.table_id.clone().map(FilterCondition::TableId),
        a.figure_id.clone().map(FilterCondition::FigureId),
        a.incident_date.map(FilterCondition::IncidentDate),
        a.incident_type.map(FilterCondition::IncidentType),
        a.client_id.clone().map(FilterCondition::ClientId),
        a.case_id.clone().map(FilterCondition::CaseId),
    ];
    // Same rendering the filter uses, so term lookups line up.
    values.extend(
        conditions
            .into_iter()
            .flatten()
            .map(|c| (c.column(), c.value_string())),
    );
    values
}

/// Ingestion-time writer. Consumed by [`TextIndexWriter::finish`], which seals the index.
pub struct TextIndexWriter {
    index: Index,
    writer: IndexWriter,
    fields: Fields,
    schema: Schema,
}

impl TextIndexWriter {
    /// Create a fresh on-disk index, replacing any previous one at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_dir_all(path)
                .with_context(|| format!("Failed to clear {}", path.display()))?;
        }
        std::fs::create_dir_all(path)?;
        let (schema, fields) = build_schema();
        let index = Index::create_in_dir(path, schema.clone())?;
        Self::from_index(index, schema, fields)
    }

    pub fn in_memory() -> Result<Self> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema.clone());
        Self::from_index(index, schema, fields)
    }

    fn from_index(index: Index, schema: Schema, fields: Fields) -> Result<Self> {
        register_tokenizer(&index);
        let writer = index
            .writer(50_000_000)
            .context("Failed to create Tantivy writer")?;
        Ok(Self {
            index,
            writer,
            fields,
            schema,
        })
    }

    pub fn add_chunks(&mut self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            let mut doc = TantivyDocument::default();
            doc.add_text(self.fields.id, &chunk.id);
            doc.add_text(self.fields.text, &chunk.text);
            for (name, value) in anchor_values(chunk) {
                let field = self.schema.get_field(name)?;
                doc.add_text(field, &value);
            }
            self.writer.add_document(doc)?;
        }
        Ok(())
    }

    /// Commit and hand back a read-only searcher. No further writes are possible.
    pub fn finish(mut self) -> Result<TextSearch> {
        self.writer.commit().context("Tantivy commit failed")?;
        self.writer
            .wait_merging_threads()
            .context("Tantivy merge failed")?;
        TextSearch::from_index(self.index, self.fields)
    }
}

/// Read-only BM25 search over chunk text.
pub struct TextSearch {
    index: Index,
    reader: IndexReader,
    fields: Fields,
}

impl TextSearch {
    pub fn open(path: &Path) -> Result<Self> {
        let index = Index::open_in_dir(path)
            .with_context(|| format!("No keyword index in {}; run ingestion first", path.display()))?;
        let schema = index.schema();
        let fields = Fields {
            id: schema.get_field("id")?,
            text: schema.get_field("text")?,
        };
        Self::from_index(index, fields)
    }

    fn from_index(index: Index, fields: Fields) -> Result<Self> {
        register_tokenizer(&index);
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("Failed to create Tantivy reader")?;
        Ok(Self {
            index,
            reader,
            fields,
        })
    }

    fn build_query(&self, query: &str, filter: &MetadataFilter) -> Result<Box<dyn Query>> {
        let parser = QueryParser::for_index(&self.index, vec![self.fields.text]);
        // Lenient parsing: user questions contain '?', '-', quotes and similar syntax.
        let (text_query, _errors) = parser.parse_query_lenient(query);

        if filter.is_empty() {
            return Ok(text_query);
        }

        let schema = self.index.schema();
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(Occur::Must, text_query)];
        for (name, value) in filter.term_clauses() {
            let field = schema
                .get_field(name)
                .map_err(|_| anyhow!("keyword index has no field '{}'", name))?;
            let term = TermQuery::new(
                Term::from_field_text(field, &value),
                IndexRecordOption::Basic,
            );
            // Filter clauses must not shift BM25 scores
            clauses.push((Occur::Must, Box::new(ConstScoreQuery::new(Box::new(term), 0.0))));
        }
        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    /// Top-`k` chunk ids by BM25 among chunks whose anchors satisfy `filter`.
    pub fn search(&self, query: &str, k: usize, filter: &MetadataFilter) -> Result<Vec<(String, f32)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();
        let parsed_query = self.build_query(query, filter)?;
        let top_docs = searcher.search(&parsed_query, &TopDocs::with_limit(k))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc = searcher.doc::<TantivyDocument>(doc_address)?;
            if let Some(id_text) = doc.get_first(self.fields.id).and_then(|v| v.as_str()) {
                results.push((id_text.to_string(), score));
            }
        }
        Ok(results)
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}
