//! Multi-table descriptive statistics and the intent-guarded correlation matrix.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{format_value, AnswerTool, NeedleTool, TableQaTool, ToolInput, ToolOutput};
use crate::error::RagResult;
use crate::tables::{parse_number, TableFrame, TableRecord};
use crate::types::Tool;

const STRONG_CORRELATION: f64 = 0.7;
const MIN_PAIRS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrongCorrelation {
    pub left: String,
    pub right: String,
    pub r: f64,
}

/// Pairwise Pearson coefficients between numeric columns, labelled `table_id.header`.
/// A cell is `None` when fewer than three aligned rows exist or a column is constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Option<f64>>>,
    pub strong_pairs: Vec<StrongCorrelation>,
}

impl CorrelationMatrix {
    /// `None` unless at least two numeric columns are available.
    pub fn compute(series: &[(String, Vec<Option<f64>>)]) -> Option<Self> {
        if series.len() < 2 {
            return None;
        }
        let n = series.len();
        let mut values = vec![vec![None; n]; n];
        let mut strong_pairs = Vec::new();
        for i in 0..n {
            values[i][i] = pearson(&series[i].1, &series[i].1);
            for j in (i + 1)..n {
                let r = pearson(&series[i].1, &series[j].1);
                values[i][j] = r;
                values[j][i] = r;
                if let Some(r) = r.filter(|r| r.abs() > STRONG_CORRELATION) {
                    strong_pairs.push(StrongCorrelation {
                        left: series[i].0.clone(),
                        right: series[j].0.clone(),
                        r,
                    });
                }
            }
        }
        Some(Self {
            columns: series.iter().map(|(name, _)| name.clone()).collect(),
            values,
            strong_pairs,
        })
    }
}

/// Pearson r over rows where both values are present, aligned by row index.
pub fn pearson(xs: &[Option<f64>], ys: &[Option<f64>]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys)
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .collect();
    if pairs.len() < MIN_PAIRS {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

#[derive(Debug)]
struct ColumnStats {
    table_id: String,
    header: String,
    count: usize,
    mean: f64,
    min: f64,
    max: f64,
    /// Explicit total row value when present, else the column sum.
    total: f64,
}

fn column_stats(frame: &TableFrame, col: usize) -> Option<ColumnStats> {
    let values: Vec<f64> = frame.column_values(col).into_iter().flatten().collect();
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    let total = frame
        .total_row()
        .and_then(|i| parse_number(&frame.rows[i][col]))
        .unwrap_or(sum);
    Some(ColumnStats {
        table_id: frame.table_id.clone(),
        header: frame.headers[col].clone(),
        count: values.len(),
        mean: sum / values.len() as f64,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        total,
    })
}

#[derive(Clone)]
pub struct StatisticsTool {
    table_qa: TableQaTool,
    needle: NeedleTool,
}

impl StatisticsTool {
    pub fn new(table_qa: TableQaTool, needle: NeedleTool) -> Self {
        Self { table_qa, needle }
    }

    /// Statistics over two or more tables. `None` when none of them has numeric data.
    pub(crate) async fn analyze(
        tables: &[TableRecord],
        correlation_intent: bool,
    ) -> RagResult<Option<ToolOutput>> {
        let mut stats = Vec::new();
        let mut series = Vec::new();
        let mut used = Vec::new();
        for record in tables {
            let frame = TableFrame::load(record).await?;
            let numeric = frame.numeric_columns();
            if numeric.is_empty() {
                continue;
            }
            used.push(record);
            for col in numeric {
                if let Some(s) = column_stats(&frame, col) {
                    stats.push(s);
                }
                series.push((
                    format!("{}.{}", frame.table_id, frame.headers[col]),
                    frame.column_values(col),
                ));
            }
        }
        if used.is_empty() {
            return Ok(None);
        }

        let mut lines = vec![format!("Statistics across {} tables:", used.len())];
        for s in &stats {
            lines.push(format!(
                "- {} / {}: count {}, mean {}, min {}, max {}, total {}",
                s.table_id,
                s.header,
                s.count,
                format_value(s.mean),
                format_value(s.min),
                format_value(s.max),
                format_value(s.total)
            ));
        }

        // Columns sharing a header across tables are compared on their totals.
        let mut shared: BTreeMap<String, Vec<&ColumnStats>> = BTreeMap::new();
        for s in &stats {
            shared.entry(s.header.trim().to_lowercase()).or_default().push(s);
        }
        for group in shared.values().filter(|g| g.len() > 1) {
            let highest = group.iter().max_by(|a, b| a.total.total_cmp(&b.total));
            let lowest = group.iter().min_by(|a, b| a.total.total_cmp(&b.total));
            if let (Some(hi), Some(lo)) = (highest, lowest) {
                lines.push(format!(
                    "Highest {}: {} ({}); lowest: {} ({})",
                    hi.header,
                    hi.table_id,
                    format_value(hi.total),
                    lo.table_id,
                    format_value(lo.total)
                ));
            }
        }

        let correlation = if correlation_intent {
            let matrix = CorrelationMatrix::compute(&series);
            match &matrix {
                Some(m) if m.strong_pairs.is_empty() => {
                    lines.push(format!("No strong correlations (|r| > {}).", STRONG_CORRELATION));
                }
                Some(m) => {
                    lines.push(format!("Strong correlations (|r| > {}):", STRONG_CORRELATION));
                    for p in &m.strong_pairs {
                        lines.push(format!("- {} ~ {}: {:.3}", p.left, p.right, p.r));
                    }
                }
                None => lines.push("Not enough numeric columns for correlation analysis.".into()),
            }
            matrix
        } else {
            None
        };

        tracing::debug!(
            tables = used.len(),
            columns = series.len(),
            correlation = correlation.is_some(),
            "Statistics computed"
        );

        let mut output = ToolOutput::from_tables(Tool::Statistics, lines.join("\n"), used);
        output.correlation = correlation;
        Ok(Some(output))
    }
}

#[async_trait]
impl AnswerTool for StatisticsTool {
    fn tool(&self) -> Tool {
        Tool::Statistics
    }

    async fn answer(&self, input: &ToolInput<'_>) -> RagResult<ToolOutput> {
        match input.tables.len() {
            0 => {
                tracing::info!("No tables linked, statistics falls back to needle");
                self.needle.answer(input).await
            }
            1 => {
                tracing::info!("Single table linked, statistics delegates to table QA");
                self.table_qa.answer(input).await
            }
            _ => match Self::analyze(input.tables, input.route.correlation_intent).await? {
                Some(output) => Ok(output),
                None => self.needle.answer(input).await,
            },
        }
    }
}
