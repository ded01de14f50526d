//! Deterministic question answering over extracted tables.
//!
//! The relevant tables and column are chosen by token overlap with the question, and the
//! answer is computed from parsed cell values. An explicit total row is read rather than
//! re-summed. No text is generated over raw table content.

use async_trait::async_trait;
use std::collections::HashSet;

use super::{content_tokens, format_value, AnswerTool, NeedleTool, ToolInput, ToolOutput};
use crate::error::RagResult;
use crate::tables::{parse_number, TableFrame, TableRecord};
use crate::types::Tool;

const VALUE_HEADERS: &[&str] = &[
    "amount", "total", "cost", "value", "premium", "payment", "paid", "sum", "price", "limit",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Sum,
    Mean,
    Max,
    Min,
    Count,
    Lookup,
}

impl Aggregate {
    fn detect(query: &str, tokens: &HashSet<String>) -> Self {
        let lowered = query.to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| tokens.contains(*w));
        if lowered.contains("how many") || lowered.contains("number of") || any(&["count"]) {
            Self::Count
        } else if any(&["average", "mean"]) {
            Self::Mean
        } else if any(&["highest", "maximum", "max", "largest", "biggest", "most"]) {
            Self::Max
        } else if any(&["lowest", "minimum", "min", "smallest", "least"]) {
            Self::Min
        } else if any(&["total", "sum", "overall", "combined", "altogether"]) {
            Self::Sum
        } else {
            Self::Lookup
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Sum => "Total",
            Self::Mean => "Average",
            Self::Max => "Highest",
            Self::Min => "Lowest",
            Self::Count => "Row count of",
            Self::Lookup => "Value of",
        }
    }
}

/// One computed answer from one table.
#[derive(Debug, Clone)]
struct TableFinding {
    column: String,
    value: f64,
    display: String,
    row_label: Option<String>,
}

#[derive(Clone)]
pub struct TableQaTool {
    needle: NeedleTool,
}

impl TableQaTool {
    pub fn new(needle: NeedleTool) -> Self {
        Self { needle }
    }

    /// Answer from tables only. `None` when no table holds a usable answer.
    pub(crate) async fn answer_from_tables(
        query: &str,
        tables: &[TableRecord],
    ) -> RagResult<Option<ToolOutput>> {
        if tables.is_empty() {
            return Ok(None);
        }
        let tokens = content_tokens(query);
        let aggregate = Aggregate::detect(query, &tokens);

        let mut frames = Vec::with_capacity(tables.len());
        for record in tables {
            frames.push((record, TableFrame::load(record).await?));
        }

        let scored: Vec<usize> = frames
            .iter()
            .map(|(record, frame)| table_score(record, frame, &tokens))
            .collect();
        let best = scored.iter().copied().max().unwrap_or(0);
        if best == 0 {
            tracing::debug!(tables = tables.len(), "No table overlaps the question");
            return Ok(None);
        }

        let mut lines = Vec::new();
        let mut used = Vec::new();
        let mut findings = Vec::new();
        for ((record, frame), score) in frames.iter().zip(&scored) {
            if *score != best {
                continue;
            }
            let Some(finding) = compute(frame, &tokens, aggregate) else {
                continue;
            };
            let mut line = format!(
                "{} {} in {} ({} p.{}): {}",
                aggregate.label(),
                finding.column,
                record.table_id,
                record.file_name,
                record.page_number,
                finding.display
            );
            if let Some(label) = &finding.row_label {
                line.push_str(&format!(" ({})", label));
            }
            lines.push(line);
            used.push(*record);
            findings.push(finding);
        }

        if used.is_empty() {
            return Ok(None);
        }
        if aggregate == Aggregate::Sum && findings.len() > 1 {
            let combined: f64 = findings.iter().map(|f| f.value).sum();
            lines.push(format!(
                "Combined across {} tables: {}",
                findings.len(),
                format_value(combined)
            ));
        }

        tracing::debug!(
            aggregate = ?aggregate,
            tables = used.len(),
            "Table answer computed"
        );
        Ok(Some(ToolOutput::from_tables(Tool::TableQa, lines.join("\n"), used)))
    }
}

fn table_score(record: &TableRecord, frame: &TableFrame, query: &HashSet<String>) -> usize {
    let mut text = format!("{} {}", record.summary, record.table_id.replace(['_', '-'], " "));
    for header in &frame.headers {
        text.push(' ');
        text.push_str(header);
    }
    content_tokens(&text).intersection(query).count()
}

/// Numeric column best matching the question: header overlap first, then value-like names,
/// then the last numeric column.
fn pick_column(frame: &TableFrame, query: &HashSet<String>) -> Option<usize> {
    let numeric = frame.numeric_columns();
    let header_score = |col: usize| content_tokens(&frame.headers[col]).intersection(query).count();
    let value_like = |col: usize| {
        let header = content_tokens(&frame.headers[col]);
        VALUE_HEADERS.iter().any(|v| header.contains(*v))
    };

    let best = numeric.iter().copied().map(header_score).max()?;
    if best > 0 {
        return numeric.iter().copied().find(|&c| header_score(c) == best);
    }
    numeric
        .iter()
        .copied()
        .find(|&c| value_like(c))
        .or_else(|| numeric.last().copied())
}

fn row_label(frame: &TableFrame, row: &[String], numeric: &[usize]) -> Option<String> {
    (0..frame.headers.len())
        .filter(|c| !numeric.contains(c))
        .map(|c| row[c].as_str())
        .find(|cell| cell.chars().any(char::is_alphabetic))
        .map(str::to_string)
}

fn compute(frame: &TableFrame, query: &HashSet<String>, aggregate: Aggregate) -> Option<TableFinding> {
    let col = pick_column(frame, query)?;
    let numeric = frame.numeric_columns();
    let column = frame.headers[col].clone();

    let cell_finding = |row: &Vec<String>| {
        parse_number(&row[col]).map(|value| TableFinding {
            column: column.clone(),
            value,
            display: row[col].clone(),
            row_label: row_label(frame, row, &numeric),
        })
    };
    let data: Vec<&Vec<String>> = frame.data_rows().collect();
    let values: Vec<(f64, &Vec<String>)> = data
        .iter()
        .filter_map(|row| parse_number(&row[col]).map(|v| (v, *row)))
        .collect();

    match aggregate {
        Aggregate::Sum => {
            if let Some(total) = frame.total_row().and_then(|i| cell_finding(&frame.rows[i])) {
                return Some(TableFinding { row_label: None, ..total });
            }
            if values.is_empty() {
                return None;
            }
            let sum: f64 = values.iter().map(|(v, _)| v).sum();
            Some(TableFinding {
                column,
                value: sum,
                display: format_value(sum),
                row_label: None,
            })
        }
        Aggregate::Mean => {
            if values.is_empty() {
                return None;
            }
            let mean = values.iter().map(|(v, _)| v).sum::<f64>() / values.len() as f64;
            Some(TableFinding {
                column,
                value: mean,
                display: format_value(mean),
                row_label: None,
            })
        }
        Aggregate::Max => values
            .iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .and_then(|(_, row)| cell_finding(*row)),
        Aggregate::Min => values
            .iter()
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .and_then(|(_, row)| cell_finding(*row)),
        Aggregate::Count => Some(TableFinding {
            column,
            value: data.len() as f64,
            display: data.len().to_string(),
            row_label: None,
        }),
        Aggregate::Lookup => {
            // Row whose text cells overlap the question most; the total row is eligible.
            let best = frame
                .rows
                .iter()
                .map(|row| {
                    let text: Vec<&str> = (0..frame.headers.len())
                        .filter(|c| !numeric.contains(c))
                        .map(|c| row[c].as_str())
                        .collect();
                    (content_tokens(&text.join(" ")).intersection(query).count(), row)
                })
                .filter(|(score, row)| *score > 0 && parse_number(&row[col]).is_some())
                .fold(None::<(usize, &Vec<String>)>, |acc, cur| match acc {
                    Some(a) if a.0 >= cur.0 => Some(a),
                    _ => Some(cur),
                });
            best.and_then(|(_, row)| cell_finding(row))
        }
    }
}

#[async_trait]
impl AnswerTool for TableQaTool {
    fn tool(&self) -> Tool {
        Tool::TableQa
    }

    async fn answer(&self, input: &ToolInput<'_>) -> RagResult<ToolOutput> {
        match Self::answer_from_tables(input.query, input.tables).await? {
            Some(output) => Ok(output),
            None => {
                tracing::info!(
                    tables = input.tables.len(),
                    "No table answers the question, falling back to needle"
                );
                self.needle.answer(input).await
            }
        }
    }
}
