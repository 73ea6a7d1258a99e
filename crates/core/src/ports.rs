//! Collaborator contracts the engine drives.
//!
//! The spreadsheet API client, the target-database adapter and the metadata
//! store each implement one of these traits; the workers and orchestrator
//! only ever see the trait objects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::detector::ChangeSet;
use crate::errors::Result;
use crate::models::{
    CellValue, ChangeLogEntry, ColumnMapping, ConflictRecord, Row, SyncConfig, SyncRun, SyncState,
};

/// Result of a conditional range read.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeRead {
    /// The remote content matches the presented ETag.
    NotModified { etag: Option<String> },
    /// Fresh content plus the ETag to present next time.
    Modified {
        grid: Vec<Vec<CellValue>>,
        etag: Option<String>,
    },
}

/// One `{range, values}` tuple for a batch update.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeValues {
    pub range: String,
    pub values: Vec<Vec<CellValue>>,
}

/// Spreadsheet API surface the engine needs.
///
/// Row deletion is emulated by clearing cells; the platform offers no true
/// row removal through this surface.
#[async_trait]
pub trait SpreadsheetPort: Send + Sync {
    /// Conditional range read honoring `If-None-Match`.
    async fn read_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
        if_none_match: Option<&str>,
    ) -> Result<RangeRead>;

    /// Batch cell update; returns the sheet ETag after the write when known.
    async fn batch_update(
        &self,
        spreadsheet_id: &str,
        updates: Vec<RangeValues>,
    ) -> Result<Option<String>>;

    /// Append rows after the last data row of `range`.
    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<Option<String>>;

    /// Clear all cells in `range`.
    async fn clear_range(&self, spreadsheet_id: &str, range: &str) -> Result<Option<String>>;
}

/// Target-database adapter: mapped-table access plus the change-capture log.
#[async_trait]
pub trait TargetTableStore: Send + Sync {
    /// Read every row of the table, projected to the mapped columns.
    async fn fetch_rows(&self, table: &str, mapping: &ColumnMapping) -> Result<Vec<Row>>;

    /// Apply a change set in one transaction: upsert inserts, keyed updates,
    /// keyed deletes. When `write_tag` is set the change-capture triggers
    /// stamp it into every change-log row the transaction produces; the tag
    /// is cleared on every exit path. Returns rows affected.
    async fn apply_changes(
        &self,
        table: &str,
        mapping: &ColumnMapping,
        changes: &ChangeSet,
        write_tag: Option<&str>,
    ) -> Result<u64>;

    /// Unprocessed change-log rows for `table`, excluding `exclude_tag`,
    /// with id greater than `after_id`, ordered ascending, bounded.
    async fn fetch_change_log(
        &self,
        table: &str,
        exclude_tag: &str,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<ChangeLogEntry>>;

    /// Change-log rows (processed or not) newer than `since`, excluding
    /// `exclude_tag`; the conflict detector's view of table-side edits.
    async fn fetch_change_log_since(
        &self,
        table: &str,
        exclude_tag: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeLogEntry>>;

    /// Flip `processed` to true for the given ids in one statement.
    async fn mark_changes_processed(&self, ids: &[i64]) -> Result<()>;
}

/// Metadata persistence: configs, per-config state, run history, conflicts.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn list_active_configs(&self) -> Result<Vec<SyncConfig>>;

    async fn get_config(&self, config_id: &str) -> Result<Option<SyncConfig>>;

    async fn get_state(&self, config_id: &str) -> Result<SyncState>;

    /// Record a completed sheet-to-table run: timestamp plus observed ETag.
    async fn record_sheet_sync(
        &self,
        config_id: &str,
        at: DateTime<Utc>,
        etag: Option<String>,
    ) -> Result<()>;

    /// Record a completed table-to-sheet run: timestamp plus the highest
    /// consumed change-log id.
    async fn record_table_sync(
        &self,
        config_id: &str,
        at: DateTime<Utc>,
        last_change_id: i64,
    ) -> Result<()>;

    /// Insert a run in its initial `Running` state.
    async fn create_run(&self, run: &SyncRun) -> Result<()>;

    /// Persist the final state of a run.
    async fn finish_run(&self, run: &SyncRun) -> Result<()>;

    async fn record_conflict(&self, record: &ConflictRecord) -> Result<()>;
}
