//! Target-table adapter: mapped reads and writes plus the change-capture log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::Text;
use log::debug;
use std::sync::Arc;

use sheetbridge_core::detector::ChangeSet;
use sheetbridge_core::models::{CellValue, ChangeLogEntry, ColumnMapping, Row};
use sheetbridge_core::ports::TargetTableStore;
use sheetbridge_core::SyncError;

use crate::db::{escape_sqlite_str, get_connection, quote_identifier, SqlitePool};
use crate::errors::{Result, StorageError};
use crate::models::{ts_to_db, ChangeLogEntryDB};
use crate::triggers::{change_capture_ddl, drop_change_capture_ddl};

/// SQL literal for one cell value.
fn cell_to_sql_literal(value: &CellValue) -> String {
    match value {
        CellValue::Null => "NULL".to_string(),
        CellValue::Bool(v) => {
            if *v {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        CellValue::Integer(v) => v.to_string(),
        CellValue::Float(v) => v.to_string(),
        CellValue::Text(v) => format!("'{}'", escape_sqlite_str(v)),
        CellValue::Timestamp(v) => format!("'{}'", escape_sqlite_str(&ts_to_db(*v))),
        CellValue::Json(v) => format!("'{}'", escape_sqlite_str(&v.to_string())),
    }
}

#[derive(QueryableByName)]
struct RowJson {
    #[diesel(sql_type = Text)]
    row_json: String,
}

/// Adapter over one target database.
///
/// Mutations run inside a single transaction that sets the write tag, issues
/// the DML and clears the tag again before commit; a rollback reverts the tag
/// with everything else, so the tag can never leak out of a failed write.
pub struct TargetTableRepository {
    pool: Arc<SqlitePool>,
}

impl TargetTableRepository {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Install the change-capture triggers for a table that is becoming
    /// actively synced.
    pub fn install_change_capture(&self, table: &str, mapping: &ColumnMapping) -> Result<()> {
        debug!("installing change-capture triggers on '{table}'");
        let mut conn = get_connection(&self.pool)?;
        for ddl in change_capture_ddl(table, mapping) {
            diesel::sql_query(ddl).execute(&mut conn)?;
        }
        Ok(())
    }

    /// Drop the capture triggers when a config is deactivated or deleted.
    pub fn remove_change_capture(&self, table: &str) -> Result<()> {
        debug!("removing change-capture triggers from '{table}'");
        let mut conn = get_connection(&self.pool)?;
        for ddl in drop_change_capture_ddl(table) {
            diesel::sql_query(ddl).execute(&mut conn)?;
        }
        Ok(())
    }

    fn fetch_rows_blocking(pool: &Arc<SqlitePool>, table: &str, mapping: &ColumnMapping) -> Result<Vec<Row>> {
        let mut conn = get_connection(pool)?;
        let pairs: Vec<String> = mapping
            .columns()
            .map(|column| format!("'{}', {}", escape_sqlite_str(column), quote_identifier(column)))
            .collect();
        let sql = format!(
            "SELECT json_object({}) AS row_json FROM {} ORDER BY {}",
            pairs.join(", "),
            quote_identifier(table),
            quote_identifier(mapping.primary_key()),
        );
        let rows = diesel::sql_query(sql).load::<RowJson>(&mut conn)?;
        rows.into_iter()
            .map(|raw| {
                let value: serde_json::Value = serde_json::from_str(&raw.row_json)
                    .map_err(|e| StorageError::data(format!("invalid row projection: {e}")))?;
                Ok(sheetbridge_core::models::row_from_json(&value))
            })
            .collect()
    }

    fn apply_changes_blocking(
        pool: &Arc<SqlitePool>,
        table: &str,
        mapping: &ColumnMapping,
        changes: &ChangeSet,
        write_tag: Option<&str>,
    ) -> Result<u64> {
        let mut conn = get_connection(pool)?;
        let key_column = mapping.primary_key().to_string();
        let table_ident = quote_identifier(table);

        conn.immediate_transaction::<u64, StorageError, _>(|conn| {
            if let Some(tag) = write_tag {
                diesel::sql_query(format!(
                    "UPDATE sync_write_tag SET tag = '{}' WHERE id = 1",
                    escape_sqlite_str(tag)
                ))
                .execute(conn)?;
            }

            let mut affected = 0u64;

            for row in &changes.inserts {
                let columns: Vec<&String> = row.keys().collect();
                let column_sql = columns
                    .iter()
                    .map(|c| quote_identifier(c.as_str()))
                    .collect::<Vec<_>>()
                    .join(", ");
                let values_sql = columns
                    .iter()
                    .map(|c| cell_to_sql_literal(&row[c.as_str()]))
                    .collect::<Vec<_>>()
                    .join(", ");
                let upserts = columns
                    .iter()
                    .filter(|c| c.as_str() != key_column)
                    .map(|c| {
                        let quoted = quote_identifier(c.as_str());
                        format!("{quoted} = excluded.{quoted}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = if upserts.is_empty() {
                    format!(
                        "INSERT INTO {table_ident} ({column_sql}) VALUES ({values_sql}) \
                         ON CONFLICT({}) DO NOTHING",
                        quote_identifier(&key_column)
                    )
                } else {
                    format!(
                        "INSERT INTO {table_ident} ({column_sql}) VALUES ({values_sql}) \
                         ON CONFLICT({}) DO UPDATE SET {upserts}",
                        quote_identifier(&key_column)
                    )
                };
                affected += diesel::sql_query(sql).execute(conn)? as u64;
            }

            for update in &changes.updates {
                let assignments = update
                    .row
                    .iter()
                    .filter(|(column, _)| column.as_str() != key_column)
                    .map(|(column, value)| {
                        format!("{} = {}", quote_identifier(column), cell_to_sql_literal(value))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                if assignments.is_empty() {
                    continue;
                }
                let sql = format!(
                    "UPDATE {table_ident} SET {assignments} WHERE {} = '{}'",
                    quote_identifier(&key_column),
                    escape_sqlite_str(&update.key),
                );
                affected += diesel::sql_query(sql).execute(conn)? as u64;
            }

            for key in &changes.deletes {
                let sql = format!(
                    "DELETE FROM {table_ident} WHERE {} = '{}'",
                    quote_identifier(&key_column),
                    escape_sqlite_str(key),
                );
                affected += diesel::sql_query(sql).execute(conn)? as u64;
            }

            if write_tag.is_some() {
                diesel::sql_query("UPDATE sync_write_tag SET tag = NULL WHERE id = 1").execute(conn)?;
            }

            Ok(affected)
        })
    }

    fn fetch_change_log_blocking(
        pool: &Arc<SqlitePool>,
        table: &str,
        exclude_tag: &str,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<ChangeLogEntry>> {
        use crate::schema::sync_change_log::dsl;

        let mut conn = get_connection(pool)?;
        let rows = dsl::sync_change_log
            .filter(dsl::table_name.eq(table))
            .filter(dsl::processed.eq(0))
            .filter(dsl::id.gt(after_id))
            .filter(dsl::source_tag.is_null().or(dsl::source_tag.ne(exclude_tag)))
            .order(dsl::id.asc())
            .limit(limit)
            .load::<ChangeLogEntryDB>(&mut conn)?;
        rows.into_iter().map(ChangeLogEntryDB::into_domain).collect()
    }

    fn fetch_change_log_since_blocking(
        pool: &Arc<SqlitePool>,
        table: &str,
        exclude_tag: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeLogEntry>> {
        use crate::schema::sync_change_log::dsl;

        let mut conn = get_connection(pool)?;
        let rows = dsl::sync_change_log
            .filter(dsl::table_name.eq(table))
            .filter(dsl::changed_at.gt(ts_to_db(since)))
            .filter(dsl::source_tag.is_null().or(dsl::source_tag.ne(exclude_tag)))
            .order(dsl::id.asc())
            .load::<ChangeLogEntryDB>(&mut conn)?;
        rows.into_iter().map(ChangeLogEntryDB::into_domain).collect()
    }

    fn mark_changes_processed_blocking(pool: &Arc<SqlitePool>, ids: &[i64]) -> Result<()> {
        use crate::schema::sync_change_log::dsl;

        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = get_connection(pool)?;
        diesel::update(dsl::sync_change_log.filter(dsl::id.eq_any(ids.to_vec())))
            .set(dsl::processed.eq(1))
            .execute(&mut conn)?;
        Ok(())
    }

    async fn run_blocking<T, F>(&self, job: F) -> sheetbridge_core::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<SqlitePool>) -> Result<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        let result = tokio::task::spawn_blocking(move || job(pool))
            .await
            .map_err(|e| SyncError::database(format!("blocking task failed: {e}")))?;
        result.map_err(SyncError::from)
    }
}

#[async_trait]
impl TargetTableStore for TargetTableRepository {
    async fn fetch_rows(&self, table: &str, mapping: &ColumnMapping) -> sheetbridge_core::Result<Vec<Row>> {
        let table = table.to_string();
        let mapping = mapping.clone();
        self.run_blocking(move |pool| Self::fetch_rows_blocking(&pool, &table, &mapping))
            .await
    }

    async fn apply_changes(
        &self,
        table: &str,
        mapping: &ColumnMapping,
        changes: &ChangeSet,
        write_tag: Option<&str>,
    ) -> sheetbridge_core::Result<u64> {
        let table = table.to_string();
        let mapping = mapping.clone();
        let changes = changes.clone();
        let write_tag = write_tag.map(str::to_string);
        self.run_blocking(move |pool| {
            Self::apply_changes_blocking(&pool, &table, &mapping, &changes, write_tag.as_deref())
        })
        .await
    }

    async fn fetch_change_log(
        &self,
        table: &str,
        exclude_tag: &str,
        after_id: i64,
        limit: i64,
    ) -> sheetbridge_core::Result<Vec<ChangeLogEntry>> {
        let table = table.to_string();
        let exclude_tag = exclude_tag.to_string();
        self.run_blocking(move |pool| {
            Self::fetch_change_log_blocking(&pool, &table, &exclude_tag, after_id, limit)
        })
        .await
    }

    async fn fetch_change_log_since(
        &self,
        table: &str,
        exclude_tag: &str,
        since: DateTime<Utc>,
    ) -> sheetbridge_core::Result<Vec<ChangeLogEntry>> {
        let table = table.to_string();
        let exclude_tag = exclude_tag.to_string();
        self.run_blocking(move |pool| {
            Self::fetch_change_log_since_blocking(&pool, &table, &exclude_tag, since)
        })
        .await
    }

    async fn mark_changes_processed(&self, ids: &[i64]) -> sheetbridge_core::Result<()> {
        let ids = ids.to_vec();
        self.run_blocking(move |pool| Self::mark_changes_processed_blocking(&pool, &ids)).await
    }
}
