//! Pool construction and schema bootstrap.

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Result, StorageError};

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
pub type SqlitePooledConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas: WAL for concurrent readers, a busy timeout so
/// writers queue instead of failing, and foreign keys on.
#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA busy_timeout = 5000; \
             PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Build a connection pool for the given SQLite database path.
pub fn create_pool(database_url: &str) -> Result<Arc<SqlitePool>> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(8)
        .connection_timeout(Duration::from_secs(10))
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .map_err(|e| StorageError::data(format!("failed to build pool: {e}")))?;
    Ok(Arc::new(pool))
}

/// Check out a connection.
pub fn get_connection(pool: &Arc<SqlitePool>) -> Result<SqlitePooledConnection> {
    Ok(pool.get()?)
}

/// Create the sync infrastructure tables when absent.
///
/// Target tables themselves are owned by the host application; only the
/// metadata tables, the change log and the write-tag cell are created here.
pub fn init_schema(conn: &mut SqliteConnection) -> Result<()> {
    conn.batch_execute(
        "CREATE TABLE IF NOT EXISTS sync_configs (
             id TEXT PRIMARY KEY NOT NULL,
             name TEXT NOT NULL,
             spreadsheet_id TEXT NOT NULL,
             range TEXT NOT NULL,
             target_table TEXT NOT NULL,
             column_mapping TEXT NOT NULL,
             conflict_policy TEXT NOT NULL,
             interval_secs INTEGER NOT NULL,
             active INTEGER NOT NULL DEFAULT 1
         );
         CREATE TABLE IF NOT EXISTS sync_state (
             config_id TEXT PRIMARY KEY NOT NULL,
             last_sheet_sync_at TEXT,
             last_db_sync_at TEXT,
             sheet_etag TEXT,
             db_last_change_id BIGINT NOT NULL DEFAULT 0,
             updated_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS sync_runs (
             id TEXT PRIMARY KEY NOT NULL,
             config_id TEXT NOT NULL,
             direction TEXT NOT NULL,
             status TEXT NOT NULL,
             started_at TEXT NOT NULL,
             completed_at TEXT,
             rows_affected BIGINT NOT NULL DEFAULT 0,
             conflicts_detected BIGINT NOT NULL DEFAULT 0,
             error TEXT,
             metadata TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_sync_runs_config ON sync_runs (config_id, started_at);
         CREATE TABLE IF NOT EXISTS sync_conflicts (
             id TEXT PRIMARY KEY NOT NULL,
             config_id TEXT NOT NULL,
             row_key TEXT NOT NULL,
             sheet_value TEXT NOT NULL,
             table_value TEXT NOT NULL,
             sheet_changed_at TEXT,
             table_changed_at TEXT,
             policy TEXT NOT NULL,
             winner TEXT NOT NULL,
             resolved_value TEXT,
             resolved_at TEXT,
             created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_sync_conflicts_config ON sync_conflicts (config_id, created_at);
         CREATE TABLE IF NOT EXISTS sync_change_log (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             table_name TEXT NOT NULL,
             op TEXT NOT NULL,
             row_snapshot TEXT NOT NULL,
             source_tag TEXT,
             changed_at TEXT NOT NULL,
             processed INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS idx_sync_change_log_scan
             ON sync_change_log (table_name, processed, id);
         CREATE TABLE IF NOT EXISTS sync_write_tag (
             id INTEGER PRIMARY KEY CHECK (id = 1),
             tag TEXT
         );
         INSERT OR IGNORE INTO sync_write_tag (id, tag) VALUES (1, NULL);",
    )?;
    Ok(())
}

/// Escape a string for inclusion in a single-quoted SQLite literal.
pub(crate) fn escape_sqlite_str(value: &str) -> String {
    value.replace('\'', "''")
}

/// Quote an identifier (table, column or trigger name).
pub(crate) fn quote_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}


#[cfg(test)]
mod tests {
    use super::*;
    use diesel::sql_types::BigInt;
    use diesel::{QueryableByName, RunQueryDsl};

    #[derive(QueryableByName)]
    struct CountRow {
        #[diesel(sql_type = BigInt)]
        c: i64,
    }

    #[test]
    fn schema_bootstrap_is_idempotent() {
        let (pool, _dir) = test_support::setup_db();
        let mut conn = get_connection(&pool).unwrap();
        init_schema(&mut conn).expect("second init is a no-op");

        for table in [
            "sync_configs",
            "sync_state",
            "sync_runs",
            "sync_conflicts",
            "sync_change_log",
            "sync_write_tag",
        ] {
            let row: CountRow = diesel::sql_query(format!(
                "SELECT COUNT(*) AS c FROM sqlite_master WHERE type = 'table' AND name = '{table}'"
            ))
            .get_result(&mut conn)
            .expect("table lookup");
            assert_eq!(row.c, 1, "missing table {table}");
        }
    }

    #[test]
    fn identifier_quoting_escapes_backticks() {
        assert_eq!(quote_identifier("people"), "`people`");
        assert_eq!(quote_identifier("odd`name"), "`odd``name`");
        assert_eq!(escape_sqlite_str("it's"), "it''s");
    }
}
