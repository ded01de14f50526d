//! Anchor validation and the metadata filter shared by both retrieval paths.
//!
//! A [`MetadataFilter`] is an exact-match conjunction over anchor fields. It is parsed once
//! per query and rendered into each backend's native form (a LanceDB SQL predicate, Tantivy
//! term clauses) from the same condition list, so dense and sparse retrieval always apply
//! the identical predicate.

use chrono::NaiveDate;
use std::collections::HashMap;

use crate::error::{RagError, RagResult};
use crate::types::{Anchors, IncidentType, SectionType};

/// Reject anchor records that break the schema invariants.
pub fn validate_anchors(chunk_id: &str, anchors: &Anchors) -> RagResult<()> {
    let invalid = |reason: &str| RagError::InvalidAnchors {
        chunk_id: chunk_id.to_string(),
        reason: reason.to_string(),
    };

    if anchors.file_name.trim().is_empty() {
        return Err(invalid("FileName is empty"));
    }
    if anchors.page_number < 1 {
        return Err(invalid("PageNumber must be >= 1"));
    }
    for (name, value) in [
        ("TableId", &anchors.table_id),
        ("FigureId", &anchors.figure_id),
        ("ClientId", &anchors.client_id),
        ("CaseId", &anchors.case_id),
    ] {
        if matches!(value, Some(v) if v.trim().is_empty()) {
            return Err(invalid(&format!("{} is present but empty", name)));
        }
    }
    if anchors.section_type.is_none() && anchors.table_id.is_none() && anchors.figure_id.is_none()
    {
        return Err(invalid(
            "at least one of SectionType, TableId, FigureId must be set",
        ));
    }
    Ok(())
}

/// One equality test against an anchor field.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterCondition {
    FileName(String),
    PageNumber(u32),
    SectionType(SectionType),
    TableId(String),
    FigureId(String),
    IncidentDate(NaiveDate),
    IncidentType(IncidentType),
    ClientId(String),
    CaseId(String),
}

impl FilterCondition {
    pub const KEYS: [&'static str; 9] = [
        "FileName",
        "PageNumber",
        "SectionType",
        "TableId",
        "FigureId",
        "IncidentDate",
        "IncidentType",
        "ClientId",
        "CaseId",
    ];

    fn parse(key: &str, value: &str) -> RagResult<Self> {
        let canonical = Self::KEYS
            .iter()
            .find(|k| k.eq_ignore_ascii_case(key.trim()) || snake(k) == key.trim())
            .ok_or_else(|| {
                RagError::InvalidFilter(format!(
                    "unknown filter key '{}' (expected one of: {})",
                    key,
                    Self::KEYS.join(", ")
                ))
            })?;

        let value = value.trim();
        let bad_value =
            |e: String| RagError::InvalidFilter(format!("bad value for {}: {}", canonical, e));

        Ok(match *canonical {
            "FileName" => Self::FileName(value.to_string()),
            "PageNumber" => Self::PageNumber(
                value
                    .parse::<u32>()
                    .map_err(|e| bad_value(format!("'{}' ({})", value, e)))?,
            ),
            "SectionType" => Self::SectionType(value.parse().map_err(bad_value)?),
            "TableId" => Self::TableId(value.to_string()),
            "FigureId" => Self::FigureId(value.to_string()),
            "IncidentDate" => Self::IncidentDate(
                NaiveDate::parse_from_str(value, "%Y-%m-%d")
                    .map_err(|e| bad_value(format!("'{}' ({})", value, e)))?,
            ),
            "IncidentType" => Self::IncidentType(value.parse().map_err(bad_value)?),
            "ClientId" => Self::ClientId(value.to_string()),
            _ => Self::CaseId(value.to_string()),
        })
    }

    /// Anchor key as exposed to callers.
    pub fn key(&self) -> &'static str {
        match self {
            Self::FileName(_) => "FileName",
            Self::PageNumber(_) => "PageNumber",
            Self::SectionType(_) => "SectionType",
            Self::TableId(_) => "TableId",
            Self::FigureId(_) => "FigureId",
            Self::IncidentDate(_) => "IncidentDate",
            Self::IncidentType(_) => "IncidentType",
            Self::ClientId(_) => "ClientId",
            Self::CaseId(_) => "CaseId",
        }
    }

    /// Storage column / index field name.
    pub fn column(&self) -> &'static str {
        match self {
            Self::FileName(_) => "file_name",
            Self::PageNumber(_) => "page_number",
            Self::SectionType(_) => "section_type",
            Self::TableId(_) => "table_id",
            Self::FigureId(_) => "figure_id",
            Self::IncidentDate(_) => "incident_date",
            Self::IncidentType(_) => "incident_type",
            Self::ClientId(_) => "client_id",
            Self::CaseId(_) => "case_id",
        }
    }

    /// Canonical string form, identical to what ingestion writes into the indexes.
    pub fn value_string(&self) -> String {
        match self {
            Self::FileName(v)
            | Self::TableId(v)
            | Self::FigureId(v)
            | Self::ClientId(v)
            | Self::CaseId(v) => v.clone(),
            Self::PageNumber(p) => p.to_string(),
            Self::SectionType(s) => s.as_str().to_string(),
            Self::IncidentDate(d) => d.format("%Y-%m-%d").to_string(),
            Self::IncidentType(t) => t.as_str().to_string(),
        }
    }

    pub fn matches(&self, anchors: &Anchors) -> bool {
        match self {
            Self::FileName(v) => anchors.file_name == *v,
            Self::PageNumber(p) => anchors.page_number == *p,
            Self::SectionType(s) => anchors.section_type == Some(*s),
            Self::TableId(v) => anchors.table_id.as_deref() == Some(v.as_str()),
            Self::FigureId(v) => anchors.figure_id.as_deref() == Some(v.as_str()),
            Self::IncidentDate(d) => anchors.incident_date == Some(*d),
            Self::IncidentType(t) => anchors.incident_type == Some(*t),
            Self::ClientId(v) => anchors.client_id.as_deref() == Some(v.as_str()),
            Self::CaseId(v) => anchors.case_id.as_deref() == Some(v.as_str()),
        }
    }

    fn to_sql(&self) -> String {
        match self {
            Self::PageNumber(p) => format!("page_number = {}", p),
            other => format!(
                "{} = '{}'",
                other.column(),
                other.value_string().replace('\'', "''")
            ),
        }
    }
}

fn snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Conjunction of exact-match anchor conditions. Empty means "no restriction".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    conditions: Vec<FilterCondition>,
}

impl MetadataFilter {
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse a caller-supplied key/value map. Unknown keys are a configuration error.
    pub fn from_map(map: &HashMap<String, String>) -> RagResult<Self> {
        let mut conditions = Vec::with_capacity(map.len());
        for (key, value) in map {
            let condition = FilterCondition::parse(key, value)?;
            if conditions
                .iter()
                .any(|c: &FilterCondition| c.key() == condition.key())
            {
                return Err(RagError::InvalidFilter(format!(
                    "filter key {} given more than once",
                    condition.key()
                )));
            }
            conditions.push(condition);
        }
        // HashMap iteration order is arbitrary; keep predicates reproducible.
        conditions.sort_by_key(|c| c.key());
        Ok(Self { conditions })
    }

    pub fn with(mut self, condition: FilterCondition) -> Self {
        self.conditions.retain(|c| c.key() != condition.key());
        self.conditions.push(condition);
        self.conditions.sort_by_key(|c| c.key());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[FilterCondition] {
        &self.conditions
    }

    pub fn case_id(&self) -> Option<&str> {
        self.conditions.iter().find_map(|c| match c {
            FilterCondition::CaseId(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn client_id(&self) -> Option<&str> {
        self.conditions.iter().find_map(|c| match c {
            FilterCondition::ClientId(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn table_id(&self) -> Option<&str> {
        self.conditions.iter().find_map(|c| match c {
            FilterCondition::TableId(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.conditions.iter().find_map(|c| match c {
            FilterCondition::FileName(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn matches(&self, anchors: &Anchors) -> bool {
        self.conditions.iter().all(|c| c.matches(anchors))
    }

    pub fn to_lance_predicate(&self) -> Option<String> {
        if self.conditions.is_empty() {
            return None;
        }
        Some(
            self.conditions
                .iter()
                .map(FilterCondition::to_sql)
                .collect::<Vec<_>>()
                .join(" AND "),
        )
    }

    /// `(field, value)` pairs for exact term matching in the keyword index.
    pub fn term_clauses(&self) -> Vec<(&'static str, String)> {
        self.conditions
            .iter()
            .map(|c| (c.column(), c.value_string()))
            .collect()
    }
}
