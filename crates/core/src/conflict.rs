//! Conflict detection and policy arbitration.
//!
//! A row is in conflict when both the spreadsheet and the table changed it
//! since the last successful sync in the opposite direction AND the changed
//! column sets overlap. Arbitration is a closed set of policies; adding a
//! policy means adding a variant and its rule here.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::detector::{row_key, ChangeSet};
use crate::models::{
    row_from_json, row_to_json, ChangeLogEntry, ChangeOp, ConflictPolicy, ConflictRecord,
    ConflictWinner, Row,
};

/// One row changed on both sides.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub key: String,
    /// The spreadsheet-side row; `None` when the sheet deleted it.
    pub sheet_row: Option<Row>,
    /// The table-side row as captured in the change log.
    pub table_row: Row,
    pub sheet_changed_at: DateTime<Utc>,
    pub table_changed_at: DateTime<Utc>,
    /// Overlapping changed columns.
    pub columns: Vec<String>,
}

/// A conflict with the winner the policy picked.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub conflict: Conflict,
    pub winner: ConflictWinner,
}

/// Columns a change-log entry touched: everything but the key for
/// INSERT/UPDATE snapshots, the whole row for DELETE.
fn log_entry_columns(entry: &ChangeLogEntry, key_column: &str) -> Option<Vec<String>> {
    match entry.op {
        ChangeOp::Delete => None,
        ChangeOp::Insert | ChangeOp::Update => Some(
            entry
                .row_snapshot
                .as_object()
                .map(|object| {
                    object
                        .keys()
                        .filter(|column| column.as_str() != key_column)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
        ),
    }
}

fn overlaps(sheet_columns: Option<&[String]>, table_columns: Option<&[String]>) -> Vec<String> {
    match (sheet_columns, table_columns) {
        // A delete touches every column, so any change on the other side overlaps.
        (None, None) => Vec::new(),
        (None, Some(columns)) | (Some(columns), None) => columns.to_vec(),
        (Some(sheet), Some(table)) => sheet
            .iter()
            .filter(|column| table.contains(column))
            .cloned()
            .collect(),
    }
}

fn entry_key(entry: &ChangeLogEntry, key_column: &str) -> Option<String> {
    row_key(&row_from_json(&entry.row_snapshot), key_column)
}

/// Detect conflicts between a freshly computed sheet-to-table change set
/// and table-side change-log entries recorded since the last table-to-sheet
/// sync. Entries tagged by the sheet-to-table worker must already be
/// filtered out by the caller's change-log query.
///
/// The spreadsheet exposes no per-cell timestamps; when
/// `sheet_changed_at` is absent the sheet change is treated as happening
/// at the moment of the read.
pub fn detect_conflicts(
    changes: &ChangeSet,
    table_changes: &[ChangeLogEntry],
    key_column: &str,
    sheet_changed_at: Option<DateTime<Utc>>,
) -> Vec<Conflict> {
    if table_changes.is_empty() {
        return Vec::new();
    }

    let sheet_changed_at = sheet_changed_at.unwrap_or_else(Utc::now);

    // Later entries for the same key supersede earlier ones.
    let mut latest_by_key: HashMap<String, &ChangeLogEntry> = HashMap::new();
    for entry in table_changes {
        if let Some(key) = entry_key(entry, key_column) {
            latest_by_key.insert(key, entry);
        }
    }

    let mut conflicts = Vec::new();

    for insert in &changes.inserts {
        let Some(key) = row_key(insert, key_column) else {
            continue;
        };
        if let Some(entry) = latest_by_key.get(&key) {
            let sheet_columns: Vec<String> = insert.keys().cloned().collect();
            let columns = overlaps(Some(&sheet_columns), log_entry_columns(entry, key_column).as_deref());
            conflicts.push(Conflict {
                key,
                sheet_row: Some(insert.clone()),
                table_row: row_from_json(&entry.row_snapshot),
                sheet_changed_at,
                table_changed_at: entry.changed_at,
                columns,
            });
        }
    }

    for update in &changes.updates {
        if let Some(entry) = latest_by_key.get(&update.key) {
            let columns = overlaps(
                Some(&update.changed_columns),
                log_entry_columns(entry, key_column).as_deref(),
            );
            if columns.is_empty() && entry.op != ChangeOp::Delete {
                continue;
            }
            conflicts.push(Conflict {
                key: update.key.clone(),
                sheet_row: Some(update.row.clone()),
                table_row: row_from_json(&entry.row_snapshot),
                sheet_changed_at,
                table_changed_at: entry.changed_at,
                columns,
            });
        }
    }

    for key in &changes.deletes {
        if let Some(entry) = latest_by_key.get(key) {
            let columns = overlaps(None, log_entry_columns(entry, key_column).as_deref());
            conflicts.push(Conflict {
                key: key.clone(),
                sheet_row: None,
                table_row: row_from_json(&entry.row_snapshot),
                sheet_changed_at,
                table_changed_at: entry.changed_at,
                columns,
            });
        }
    }

    conflicts
}

/// Pick the winning side for one conflict.
///
/// Last-write-wins compares change instants; a tie goes to the spreadsheet
/// so arbitration stays deterministic.
pub fn resolve(policy: ConflictPolicy, conflict: &Conflict) -> ConflictWinner {
    match policy {
        ConflictPolicy::SheetWins => ConflictWinner::Sheet,
        ConflictPolicy::TableWins => ConflictWinner::Table,
        ConflictPolicy::Manual => ConflictWinner::Manual,
        ConflictPolicy::LastWriteWins => {
            if conflict.table_changed_at > conflict.sheet_changed_at {
                ConflictWinner::Table
            } else {
                ConflictWinner::Sheet
            }
        }
    }
}

/// Resolve every conflict under the given policy.
pub fn resolve_all(policy: ConflictPolicy, conflicts: Vec<Conflict>) -> Vec<ResolvedConflict> {
    conflicts
        .into_iter()
        .map(|conflict| {
            let winner = resolve(policy, &conflict);
            ResolvedConflict { conflict, winner }
        })
        .collect()
}

/// Filter the sheet-to-table change set by the resolutions: a sheet win
/// keeps the change, a table or manual win drops it for this cycle.
pub fn apply_resolutions(mut changes: ChangeSet, resolved: &[ResolvedConflict], key_column: &str) -> ChangeSet {
    let dropped: Vec<&str> = resolved
        .iter()
        .filter(|r| r.winner != ConflictWinner::Sheet)
        .map(|r| r.conflict.key.as_str())
        .collect();
    if dropped.is_empty() {
        return changes;
    }

    changes.inserts.retain(|row| {
        row_key(row, key_column).map_or(true, |key| !dropped.contains(&key.as_str()))
    });
    changes.updates.retain(|update| !dropped.contains(&update.key.as_str()));
    changes.deletes.retain(|key| !dropped.contains(&key.as_str()));
    changes
}

impl ResolvedConflict {
    /// Materialize the persistent conflict record.
    pub fn to_record(&self, config_id: &str, policy: ConflictPolicy) -> ConflictRecord {
        let sheet_value = self
            .conflict
            .sheet_row
            .as_ref()
            .map(row_to_json)
            .unwrap_or(serde_json::Value::Null);
        let table_value = row_to_json(&self.conflict.table_row);
        let resolved_value = match self.winner {
            ConflictWinner::Sheet => Some(sheet_value.clone()),
            ConflictWinner::Table => Some(table_value.clone()),
            ConflictWinner::Manual => None,
        };
        ConflictRecord {
            id: Uuid::new_v4().to_string(),
            config_id: config_id.to_string(),
            row_key: self.conflict.key.clone(),
            sheet_value,
            table_value,
            sheet_changed_at: Some(self.conflict.sheet_changed_at),
            table_changed_at: Some(self.conflict.table_changed_at),
            policy,
            winner: self.winner,
            resolved_value,
            resolved_at: match self.winner {
                ConflictWinner::Manual => None,
                _ => Some(Utc::now()),
            },
        }
    }
}
