//! Extracted tables: the registry and CSV-backed frames.

pub mod registry;

pub use registry::{TableRecord, TableRegistry};

use anyhow::{Context, Result};
use std::io::Read;
use std::sync::LazyLock;

use crate::error::{RagError, RagResult};

static NUMBER_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^(\()?\s*([-+])?\s*[$€£]?\s*(\d[\d,]*(?:\.\d+)?|\.\d+)\s*%?\s*(\))?$")
        .expect("number regex is valid")
});

fn total_label_rank(label: &str) -> Option<u8> {
    match label {
        "grand total" => Some(3),
        "total" | "totals" => Some(2),
        "subtotal" | "sub-total" | "sub total" => Some(1),
        _ => None,
    }
}

/// Parse a table cell as a number. Understands currency symbols, thousands separators,
/// trailing percent signs and accounting-style `(123.45)` negatives.
pub fn parse_number(cell: &str) -> Option<f64> {
    let caps = NUMBER_RE.captures(cell.trim())?;
    let open = caps.get(1).is_some();
    let close = caps.get(4).is_some();
    if open != close {
        return None;
    }
    let digits = caps.get(3)?.as_str().replace(',', "");
    let value: f64 = digits.parse().ok()?;
    let negative = open || caps.get(2).map(|m| m.as_str() == "-").unwrap_or(false);
    Some(if negative { -value } else { value })
}

/// Row-major view of one table. Rows are padded to the header width.
#[derive(Debug, Clone)]
pub struct TableFrame {
    pub table_id: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TableFrame {
    pub fn from_record(record: &TableRecord) -> RagResult<Self> {
        let file = std::fs::File::open(&record.csv_path).map_err(|e| RagError::TableUnreadable {
            table_id: record.table_id.clone(),
            reason: format!("{}: {}", record.csv_path.display(), e),
        })?;
        Self::from_reader(&record.table_id, file).map_err(|e| RagError::TableUnreadable {
            table_id: record.table_id.clone(),
            reason: format!("{:#}", e),
        })
    }

    /// [`Self::from_record`] off the async executor.
    pub async fn load(record: &TableRecord) -> RagResult<Self> {
        let owned = record.clone();
        tokio::task::spawn_blocking(move || Self::from_record(&owned))
            .await
            .map_err(|e| RagError::TableUnreadable {
                table_id: record.table_id.clone(),
                reason: format!("table reader task failed: {}", e),
            })?
    }

    pub fn from_reader<R: Read>(table_id: &str, reader: R) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = csv
            .headers()
            .context("Failed to read CSV header")?
            .iter()
            .enumerate()
            .map(|(i, h)| if h.is_empty() { format!("column_{}", i + 1) } else { h.to_string() })
            .collect();

        let mut rows = Vec::new();
        for (line, record) in csv.records().enumerate() {
            let record = record.with_context(|| format!("Malformed CSV row {}", line + 2))?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(headers.len().max(row.len()), String::new());
            row.truncate(headers.len());
            if row.iter().all(|c| c.is_empty()) {
                continue;
            }
            rows.push(row);
        }

        Ok(Self {
            table_id: table_id.to_string(),
            headers,
            rows,
        })
    }

    /// Index of the table's overall total. Labels rank "Grand Total" above "Total" above
    /// "Subtotal", and the last row wins a tie. A row whose label only mentions "total"
    /// (e.g. "Total paid to date") qualifies when every number in it equals the sum of the
    /// other rows in its column; line items such as "Total loss vehicle payout" stay data.
    pub fn total_row(&self) -> Option<usize> {
        self.total_rows()
            .into_iter()
            .max_by_key(|&(i, rank)| (rank, i))
            .map(|(i, _)| i)
    }

    /// Every total or subtotal row with its label rank.
    fn total_rows(&self) -> Vec<(usize, u8)> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| {
                let labels: Vec<String> = row
                    .iter()
                    .filter(|cell| parse_number(cell).is_none())
                    .map(|cell| cell.trim().trim_end_matches(':').trim().to_lowercase())
                    .filter(|cell| !cell.is_empty())
                    .collect();
                if let Some(rank) = labels.iter().filter_map(|l| total_label_rank(l)).max() {
                    return Some((i, rank));
                }
                let mentions_total = labels
                    .iter()
                    .any(|l| l.split_whitespace().any(|w| w == "total" || w == "totals"));
                (mentions_total && self.sums_other_rows(i)).then_some((i, 2))
            })
            .collect()
    }

    fn sums_other_rows(&self, candidate: usize) -> bool {
        let mut checked = 0;
        for (col, cell) in self.rows[candidate].iter().enumerate() {
            let Some(value) = parse_number(cell) else {
                continue;
            };
            let rest: f64 = self
                .rows
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != candidate)
                .filter_map(|(_, row)| parse_number(&row[col]))
                .sum();
            if (rest - value).abs() > 0.005 {
                return false;
            }
            checked += 1;
        }
        checked > 0 && self.rows.len() > 2
    }

    /// Rows that hold data, i.e. everything except total and subtotal rows.
    pub fn data_rows(&self) -> impl Iterator<Item = &Vec<String>> {
        let totals: Vec<usize> = self.total_rows().into_iter().map(|(i, _)| i).collect();
        self.rows
            .iter()
            .enumerate()
            .filter(move |(i, _)| !totals.contains(i))
            .map(|(_, row)| row)
    }

    /// Columns whose non-empty data cells all parse as numbers (at least one value).
    pub fn numeric_columns(&self) -> Vec<usize> {
        (0..self.headers.len())
            .filter(|&col| {
                let mut seen = 0;
                for row in self.data_rows() {
                    let cell = &row[col];
                    if cell.is_empty() {
                        continue;
                    }
                    if parse_number(cell).is_none() {
                        return false;
                    }
                    seen += 1;
                }
                seen > 0
            })
            .collect()
    }

    /// Parsed data values of `col`, aligned by data-row index.
    pub fn column_values(&self, col: usize) -> Vec<Option<f64>> {
        self.data_rows().map(|row| parse_number(&row[col])).collect()
    }
}
