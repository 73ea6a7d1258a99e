//! Keyed diff between two row sets.

use log::warn;
use std::collections::{HashMap, HashSet};

use crate::models::{CellValue, Row};

/// An update to an existing row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    /// Canonical primary-key string.
    pub key: String,
    pub row: Row,
    /// Non-ignored columns whose values differ from the baseline.
    pub changed_columns: Vec<String>,
}

/// Result of diffing `current` against `baseline`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub inserts: Vec<Row>,
    pub updates: Vec<RowChange>,
    /// Canonical keys of rows present in the baseline but not in `current`.
    pub deletes: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

/// Canonical key for a row, or `None` when the key cell is missing, null,
/// or blank. Canonicalization makes `1` and `"1"` the same key after a trip
/// through a spreadsheet cell.
pub fn row_key(row: &Row, key_column: &str) -> Option<String> {
    let value = row.get(key_column)?;
    if value.is_null() {
        return None;
    }
    let key = value.canonical_string();
    (!key.is_empty()).then_some(key)
}

fn index_rows<'a>(
    rows: &'a [Row],
    key_column: &str,
    side: &str,
) -> (Vec<(String, &'a Row)>, HashMap<String, &'a Row>) {
    let mut ordered = Vec::with_capacity(rows.len());
    let mut by_key = HashMap::with_capacity(rows.len());
    for row in rows {
        match row_key(row, key_column) {
            Some(key) => {
                if by_key.insert(key.clone(), row).is_some() {
                    warn!("duplicate key '{key}' in {side} rows; keeping the later row");
                    if let Some(slot) = ordered.iter_mut().find(|(k, _)| *k == key) {
                        slot.1 = row;
                    }
                } else {
                    ordered.push((key, row));
                }
            }
            None => warn!("skipping {side} row with missing or empty key column '{key_column}'"),
        }
    }
    (ordered, by_key)
}

/// Diff `current` against `baseline`, keyed by `key_column`.
///
/// Output ordering is deterministic: inserts and updates follow the
/// iteration order of `current`, deletes the order of `baseline`.
pub fn detect_changes(
    current: &[Row],
    baseline: &[Row],
    key_column: &str,
    ignore_columns: &HashSet<String>,
) -> ChangeSet {
    let (current_ordered, _) = index_rows(current, key_column, "current");
    let (baseline_ordered, baseline_by_key) = index_rows(baseline, key_column, "baseline");
    let current_keys: HashSet<&String> = current_ordered.iter().map(|(k, _)| k).collect();

    let mut changes = ChangeSet::default();

    for (key, row) in &current_ordered {
        match baseline_by_key.get(key) {
            None => changes.inserts.push((*row).clone()),
            Some(baseline_row) => {
                let changed = changed_columns(row, baseline_row, ignore_columns);
                if !changed.is_empty() {
                    changes.updates.push(RowChange {
                        key: key.clone(),
                        row: (*row).clone(),
                        changed_columns: changed,
                    });
                }
            }
        }
    }

    for (key, _) in &baseline_ordered {
        if !current_keys.contains(key) {
            changes.deletes.push(key.clone());
        }
    }

    changes
}

/// Non-ignored columns whose values differ between the two rows.
pub fn changed_columns(current: &Row, baseline: &Row, ignore_columns: &HashSet<String>) -> Vec<String> {
    let mut changed = Vec::new();
    for (column, value) in current {
        if ignore_columns.contains(column) {
            continue;
        }
        let baseline_value = baseline.get(column).unwrap_or(&CellValue::Null);
        if !value.loose_eq(baseline_value) {
            changed.push(column.clone());
        }
    }
    for column in baseline.keys() {
        if !ignore_columns.contains(column) && !current.contains_key(column) {
            changed.push(column.clone());
        }
    }
    changed
}
