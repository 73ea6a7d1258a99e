//! Cell values and the loose equality used when diffing spreadsheet data.
//!
//! Spreadsheet cells arrive untyped, so a value that left the table as the
//! integer `1` can come back as the string `"1"`. Leaf equality therefore
//! compares trimmed canonical strings; timestamps compare by instant and
//! JSON values structurally.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum CellValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

/// A row keyed by target-table column name.
///
/// `BTreeMap` keeps the keys sorted, which gives row snapshots a stable
/// canonical JSON encoding and keeps diffs free of key-order noise.
pub type Row = BTreeMap<String, CellValue>;

impl CellValue {
    /// Whether the value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Canonical string form used for loose leaf comparison and row keys.
    ///
    /// Integral floats render without a fractional part so `1.0` and `"1"`
    /// compare equal after a trip through a spreadsheet cell.
    pub fn canonical_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(v) => v.to_string(),
            Self::Integer(v) => v.to_string(),
            Self::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    format!("{}", *v as i64)
                } else {
                    v.to_string()
                }
            }
            Self::Text(v) => v.trim().to_string(),
            Self::Timestamp(v) => v.to_rfc3339_opts(SecondsFormat::Millis, true),
            Self::Json(v) => v.to_string(),
        }
    }

    /// Loose equality tolerating type laundering through spreadsheet cells.
    pub fn loose_eq(&self, other: &CellValue) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Null, _) | (_, Self::Null) => false,
            (Self::Timestamp(a), Self::Timestamp(b)) => a.timestamp_millis() == b.timestamp_millis(),
            (Self::Timestamp(ts), Self::Text(text)) | (Self::Text(text), Self::Timestamp(ts)) => {
                match DateTime::parse_from_rfc3339(text.trim()) {
                    Ok(parsed) => parsed.timestamp_millis() == ts.timestamp_millis(),
                    Err(_) => false,
                }
            }
            (Self::Json(a), Self::Json(b)) => a == b,
            _ => self.canonical_string() == other.canonical_string(),
        }
    }
}

impl From<serde_json::Value> for CellValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(v) => Self::Bool(v),
            serde_json::Value::Number(v) => {
                if let Some(i) = v.as_i64() {
                    Self::Integer(i)
                } else {
                    Self::Float(v.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(v) => Self::Text(v),
            other => Self::Json(other),
        }
    }
}

impl From<CellValue> for serde_json::Value {
    fn from(value: CellValue) -> Self {
        match value {
            CellValue::Null => serde_json::Value::Null,
            CellValue::Bool(v) => serde_json::Value::Bool(v),
            CellValue::Integer(v) => serde_json::Value::from(v),
            CellValue::Float(v) => {
                serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            CellValue::Text(v) => serde_json::Value::String(v),
            CellValue::Timestamp(v) => {
                serde_json::Value::String(v.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            CellValue::Json(v) => v,
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Convert a row to its canonical JSON object.
pub fn row_to_json(row: &Row) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (column, value) in row {
        object.insert(column.clone(), value.clone().into());
    }
    serde_json::Value::Object(object)
}

/// Build a row from a JSON object; non-object values yield an empty row.
pub fn row_from_json(value: &serde_json::Value) -> Row {
    let mut row = Row::new();
    if let Some(object) = value.as_object() {
        for (column, cell) in object {
            row.insert(column.clone(), CellValue::from(cell.clone()));
        }
    }
    row
}
