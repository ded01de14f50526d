use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::anchors::MetadataFilter;
use crate::error::{RagError, RagResult};
use crate::types::{Anchors, Chunk, SectionType};

/// One extracted table, as written by the table extraction stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    #[serde(default)]
    pub table_id: String,
    #[serde(alias = "page")]
    pub page_number: u32,
    #[serde(alias = "csv")]
    pub csv_path: PathBuf,
    pub file_name: String,
    #[serde(default, alias = "method")]
    pub extraction_method: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl TableRecord {
    /// Anchors used when a table is cited.
    pub fn anchors(&self) -> Anchors {
        let mut anchors = Anchors::new(self.file_name.clone(), self.page_number, SectionType::Table);
        anchors.table_id = Some(self.table_id.clone());
        anchors.case_id = self.case_id.clone();
        anchors.client_id = self.client_id.clone();
        anchors
    }

    /// A record contradicts the filter when one of its own identifying fields is set and differs.
    fn contradicts(&self, filter: &MetadataFilter) -> bool {
        let differs = |own: Option<&str>, wanted: Option<&str>| matches!((own, wanted), (Some(a), Some(b)) if a != b);
        differs(self.case_id.as_deref(), filter.case_id())
            || differs(self.client_id.as_deref(), filter.client_id())
            || differs(Some(self.table_id.as_str()), filter.table_id())
            || differs(Some(self.file_name.as_str()), filter.file_name())
    }

    fn owns(&self, filter: &MetadataFilter) -> bool {
        let same = |own: Option<&str>, wanted: Option<&str>| matches!((own, wanted), (Some(a), Some(b)) if a == b);
        same(self.case_id.as_deref(), filter.case_id())
            || same(self.client_id.as_deref(), filter.client_id())
            || same(Some(self.table_id.as_str()), filter.table_id())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    Map(BTreeMap<String, TableRecord>),
    List(Vec<TableRecord>),
}

/// Read-only index of extracted tables keyed by table id.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    records: BTreeMap<String, TableRecord>,
}

impl TableRegistry {
    /// Load `registry.json`. Relative CSV paths resolve against the registry's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read table registry {}", path.display()))?;
        let parsed: RegistryFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse table registry {}", path.display()))?;

        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let entries: Vec<(Option<String>, TableRecord)> = match parsed {
            RegistryFile::Map(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
            RegistryFile::List(list) => list.into_iter().map(|v| (None, v)).collect(),
        };

        let mut records = Vec::with_capacity(entries.len());
        for (key, mut record) in entries {
            if record.table_id.is_empty() {
                record.table_id = key.unwrap_or_default();
            }
            if record.csv_path.is_relative() {
                record.csv_path = base.join(&record.csv_path);
            }
            records.push(record);
        }

        let registry = Self::from_records(records)?;
        tracing::info!(tables = registry.len(), path = %path.display(), "Table registry loaded");
        Ok(registry)
    }

    /// Load when the file exists, otherwise start empty.
    pub fn load_or_empty(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(path = %path.display(), "No table registry found, table tools will fall back to text");
            Ok(Self::default())
        }
    }

    pub fn from_records(records: Vec<TableRecord>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for record in records {
            if record.table_id.trim().is_empty() {
                anyhow::bail!("Table record for {} has no table_id", record.file_name);
            }
            if map.insert(record.table_id.clone(), record).is_some() {
                anyhow::bail!("Duplicate table_id in registry");
            }
        }
        Ok(Self { records: map })
    }

    pub fn get(&self, table_id: &str) -> Option<&TableRecord> {
        self.records.get(table_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableRecord> {
        self.records.values()
    }

    /// Tables linked to `filter`.
    ///
    /// An empty filter selects every table. Otherwise a table is selected when its own
    /// `case_id`/`client_id`/`table_id` equals the filter's, or when it is referenced by
    /// `TableId` from, or shares a file with, one of `matching_chunks`. Records whose own
    /// identifiers contradict the filter are never selected. Table ids referenced by the
    /// filter or the chunks must exist in the registry.
    pub fn resolve(
        &self,
        filter: &MetadataFilter,
        matching_chunks: &[Chunk],
    ) -> RagResult<Vec<TableRecord>> {
        if let Some(table_id) = filter.table_id() {
            if !self.records.contains_key(table_id) {
                return Err(RagError::TableNotFound {
                    table_id: table_id.to_string(),
                });
            }
        }

        if filter.is_empty() {
            return Ok(self.records.values().cloned().collect());
        }

        let mut referenced = HashSet::new();
        let mut files = HashSet::new();
        for chunk in matching_chunks {
            files.insert(chunk.anchors.file_name.as_str());
            if let Some(table_id) = chunk.anchors.table_id.as_deref() {
                if !self.records.contains_key(table_id) {
                    return Err(RagError::TableNotFound {
                        table_id: table_id.to_string(),
                    });
                }
                referenced.insert(table_id);
            }
        }

        let selected: Vec<TableRecord> = self
            .records
            .values()
            .filter(|r| !r.contradicts(filter))
            .filter(|r| {
                r.owns(filter)
                    || referenced.contains(r.table_id.as_str())
                    || files.contains(r.file_name.as_str())
            })
            .cloned()
            .collect();

        tracing::debug!(
            selected = selected.len(),
            referenced = referenced.len(),
            files = files.len(),
            "Resolved tables for filter"
        );
        Ok(selected)
    }
}
