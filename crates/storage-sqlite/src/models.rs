//! Database row structs and conversions to the domain models.

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use sheetbridge_core::models::{
    ChangeLogEntry, ChangeOp, ColumnMapping, ConflictRecord, SyncConfig, SyncRun, SyncState,
};

use crate::errors::{Result, StorageError};

pub(crate) fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    let raw = serde_json::to_string(value).map_err(|e| StorageError::data(e.to_string()))?;
    Ok(raw.trim_matches('"').to_string())
}

pub(crate) fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_str(&format!("\"{value}\"")).map_err(|e| StorageError::data(e.to_string()))
}

/// RFC3339 with fixed millisecond precision: lexicographic order matches
/// chronological order, and the trigger-side `strftime` produces the same
/// shape.
pub(crate) fn ts_to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn ts_from_db(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::data(format!("invalid timestamp '{raw}': {e}")))
}

pub(crate) fn opt_ts_from_db(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(ts_from_db).transpose()
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::sync_configs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncConfigDB {
    pub id: String,
    pub name: String,
    pub spreadsheet_id: String,
    pub range: String,
    pub target_table: String,
    pub column_mapping: String,
    pub conflict_policy: String,
    pub interval_secs: i32,
    pub active: i32,
}

impl SyncConfigDB {
    pub fn from_domain(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            range: config.range.clone(),
            target_table: config.target_table.clone(),
            column_mapping: serde_json::to_string(&config.mapping)
                .map_err(|e| StorageError::data(e.to_string()))?,
            conflict_policy: enum_to_db(&config.conflict_policy)?,
            interval_secs: config.interval_secs as i32,
            active: i32::from(config.active),
        })
    }

    pub fn into_domain(self) -> Result<SyncConfig> {
        let mapping: ColumnMapping = serde_json::from_str(&self.column_mapping)
            .map_err(|e| StorageError::data(format!("invalid column mapping: {e}")))?;
        Ok(SyncConfig {
            id: self.id,
            name: self.name,
            spreadsheet_id: self.spreadsheet_id,
            range: self.range,
            target_table: self.target_table,
            mapping,
            conflict_policy: enum_from_db(&self.conflict_policy)?,
            interval_secs: self.interval_secs.max(0) as u32,
            active: self.active != 0,
        })
    }
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone, Serialize, Deserialize)]
#[diesel(primary_key(config_id))]
#[diesel(table_name = crate::schema::sync_state)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncStateDB {
    pub config_id: String,
    pub last_sheet_sync_at: Option<String>,
    pub last_db_sync_at: Option<String>,
    pub sheet_etag: Option<String>,
    pub db_last_change_id: i64,
    pub updated_at: String,
}

impl SyncStateDB {
    pub fn empty(config_id: &str) -> Self {
        Self {
            config_id: config_id.to_string(),
            last_sheet_sync_at: None,
            last_db_sync_at: None,
            sheet_etag: None,
            db_last_change_id: 0,
            updated_at: ts_to_db(Utc::now()),
        }
    }

    pub fn into_domain(self) -> Result<SyncState> {
        Ok(SyncState {
            last_sheet_sync_at: opt_ts_from_db(self.last_sheet_sync_at.as_deref())?,
            last_db_sync_at: opt_ts_from_db(self.last_db_sync_at.as_deref())?,
            sheet_etag: self.sheet_etag,
            db_last_change_id: self.db_last_change_id,
        })
    }
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::sync_runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncRunDB {
    pub id: String,
    pub config_id: String,
    pub direction: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub rows_affected: i64,
    pub conflicts_detected: i64,
    pub error: Option<String>,
    pub metadata: Option<String>,
}

impl SyncRunDB {
    pub fn from_domain(run: &SyncRun) -> Result<Self> {
        Ok(Self {
            id: run.id.clone(),
            config_id: run.config_id.clone(),
            direction: enum_to_db(&run.direction)?,
            status: enum_to_db(&run.status)?,
            started_at: ts_to_db(run.started_at),
            completed_at: run.completed_at.map(ts_to_db),
            rows_affected: run.rows_affected as i64,
            conflicts_detected: run.conflicts_detected as i64,
            error: run.error.clone(),
            metadata: if run.metadata.is_null() {
                None
            } else {
                Some(run.metadata.to_string())
            },
        })
    }

    pub fn into_domain(self) -> Result<SyncRun> {
        Ok(SyncRun {
            direction: enum_from_db(&self.direction)?,
            status: enum_from_db(&self.status)?,
            started_at: ts_from_db(&self.started_at)?,
            completed_at: opt_ts_from_db(self.completed_at.as_deref())?,
            rows_affected: self.rows_affected.max(0) as u64,
            conflicts_detected: self.conflicts_detected.max(0) as u64,
            metadata: self
                .metadata
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(serde_json::Value::Null),
            id: self.id,
            config_id: self.config_id,
            error: self.error,
        })
    }
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::sync_conflicts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncConflictDB {
    pub id: String,
    pub config_id: String,
    pub row_key: String,
    pub sheet_value: String,
    pub table_value: String,
    pub sheet_changed_at: Option<String>,
    pub table_changed_at: Option<String>,
    pub policy: String,
    pub winner: String,
    pub resolved_value: Option<String>,
    pub resolved_at: Option<String>,
    pub created_at: String,
}

impl SyncConflictDB {
    pub fn from_domain(record: &ConflictRecord) -> Result<Self> {
        Ok(Self {
            id: record.id.clone(),
            config_id: record.config_id.clone(),
            row_key: record.row_key.clone(),
            sheet_value: record.sheet_value.to_string(),
            table_value: record.table_value.to_string(),
            sheet_changed_at: record.sheet_changed_at.map(ts_to_db),
            table_changed_at: record.table_changed_at.map(ts_to_db),
            policy: enum_to_db(&record.policy)?,
            winner: enum_to_db(&record.winner)?,
            resolved_value: record.resolved_value.as_ref().map(|v| v.to_string()),
            resolved_at: record.resolved_at.map(ts_to_db),
            created_at: ts_to_db(Utc::now()),
        })
    }

    pub fn into_domain(self) -> Result<ConflictRecord> {
        Ok(ConflictRecord {
            sheet_value: serde_json::from_str(&self.sheet_value)
                .map_err(|e| StorageError::data(e.to_string()))?,
            table_value: serde_json::from_str(&self.table_value)
                .map_err(|e| StorageError::data(e.to_string()))?,
            sheet_changed_at: opt_ts_from_db(self.sheet_changed_at.as_deref())?,
            table_changed_at: opt_ts_from_db(self.table_changed_at.as_deref())?,
            policy: enum_from_db(&self.policy)?,
            winner: enum_from_db(&self.winner)?,
            resolved_value: self
                .resolved_value
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| StorageError::data(e.to_string()))?,
            resolved_at: opt_ts_from_db(self.resolved_at.as_deref())?,
            id: self.id,
            config_id: self.config_id,
            row_key: self.row_key,
        })
    }
}

#[derive(Queryable, Identifiable, Selectable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::sync_change_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ChangeLogEntryDB {
    pub id: i64,
    pub table_name: String,
    pub op: String,
    pub row_snapshot: String,
    pub source_tag: Option<String>,
    pub changed_at: String,
    pub processed: i32,
}

impl ChangeLogEntryDB {
    pub fn into_domain(self) -> Result<ChangeLogEntry> {
        let op: ChangeOp = enum_from_db(&self.op)?;
        Ok(ChangeLogEntry {
            id: self.id,
            table_name: self.table_name,
            op,
            row_snapshot: serde_json::from_str(&self.row_snapshot)
                .map_err(|e| StorageError::data(format!("invalid row snapshot: {e}")))?,
            source_tag: self.source_tag,
            changed_at: ts_from_db(&self.changed_at)?,
            processed: self.processed != 0,
        })
    }
}
