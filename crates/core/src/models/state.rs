//! Cross-cycle sync state, run history, conflicts and the change log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Write tag stamped on change-log rows produced by the sheet-to-table
/// worker; the table-to-sheet worker never consumes rows carrying it.
pub const FROM_SHEET_TAG: &str = "from_sheet";

/// Default tag for writes that arrive without an explicit source.
pub const EXTERNAL_TAG: &str = "external";

/// Which direction of a cycle a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    SheetToTable,
    TableToSheet,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SheetToTable => "sheet_to_table",
            Self::TableToSheet => "table_to_sheet",
        }
    }
}

/// Per-config incremental sync state, updated only by the workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub last_sheet_sync_at: Option<DateTime<Utc>>,
    pub last_db_sync_at: Option<DateTime<Utc>>,
    pub sheet_etag: Option<String>,
    pub db_last_change_id: i64,
}

/// Run outcome recorded in the audit history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Partial,
}

/// One audited worker run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub id: String,
    pub config_id: String,
    pub direction: SyncDirection,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rows_affected: u64,
    pub conflicts_detected: u64,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

impl SyncRun {
    /// Start a new run in the `Running` state.
    pub fn begin(config_id: &str, direction: SyncDirection) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config_id: config_id.to_string(),
            direction,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            rows_affected: 0,
            conflicts_detected: 0,
            error: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Finalize the run with an outcome.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }

    /// Wall-clock duration in milliseconds, once completed.
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Which side a conflict resolution favored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    Sheet,
    Table,
    Manual,
}

/// Persisted record of one detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub config_id: String,
    pub row_key: String,
    pub sheet_value: serde_json::Value,
    pub table_value: serde_json::Value,
    pub sheet_changed_at: Option<DateTime<Utc>>,
    pub table_changed_at: Option<DateTime<Utc>>,
    pub policy: super::config::ConflictPolicy,
    pub winner: ConflictWinner,
    pub resolved_value: Option<serde_json::Value>,
    /// `None` while a manual conflict awaits resolution.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Row-level operation captured in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// One append-only change-log row captured by the target-table triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    /// Strictly increasing identifier.
    pub id: i64,
    pub table_name: String,
    pub op: ChangeOp,
    /// JSON snapshot of the row: full mapped columns for INSERT/UPDATE,
    /// primary key only for DELETE.
    pub row_snapshot: serde_json::Value,
    pub source_tag: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub processed: bool,
}
