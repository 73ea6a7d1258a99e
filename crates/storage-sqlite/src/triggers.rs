//! Change-capture trigger DDL for synced target tables.
//!
//! Three AFTER-row triggers per table append to `sync_change_log`. Each
//! trigger stamps the row with the current write tag, defaulting to
//! `external` when no tagged transaction is in flight. INSERT and UPDATE
//! capture every mapped column; DELETE captures the primary key only.

use sheetbridge_core::models::ColumnMapping;

use crate::db::{escape_sqlite_str, quote_identifier};

/// `json_object('col', REF.`col`, ...)` over the mapped columns.
fn snapshot_expr(columns: &[&str], row_ref: &str) -> String {
    let pairs: Vec<String> = columns
        .iter()
        .map(|column| {
            format!(
                "'{}', {row_ref}.{}",
                escape_sqlite_str(column),
                quote_identifier(column)
            )
        })
        .collect();
    format!("json_object({})", pairs.join(", "))
}

const CURRENT_TAG: &str = "COALESCE((SELECT tag FROM sync_write_tag WHERE id = 1), 'external')";
const CHANGED_AT: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

fn trigger_name(table: &str, op: &str) -> String {
    format!("sync_capture_{table}_{op}")
}

fn capture_trigger(table: &str, op: &str, event: &str, snapshot: &str) -> String {
    format!(
        "CREATE TRIGGER IF NOT EXISTS {trigger} AFTER {event} ON {table_ident} \
         BEGIN \
             INSERT INTO sync_change_log (table_name, op, row_snapshot, source_tag, changed_at, processed) \
             VALUES ('{table_lit}', '{op_lit}', {snapshot}, {CURRENT_TAG}, {CHANGED_AT}, 0); \
         END",
        trigger = quote_identifier(&trigger_name(table, op)),
        table_ident = quote_identifier(table),
        table_lit = escape_sqlite_str(table),
        op_lit = op.to_uppercase(),
    )
}

/// DDL statements installing the three capture triggers for `table`.
pub fn change_capture_ddl(table: &str, mapping: &ColumnMapping) -> Vec<String> {
    let columns: Vec<&str> = mapping.columns().collect();
    let key_column = [mapping.primary_key()];
    vec![
        capture_trigger(table, "insert", "INSERT", &snapshot_expr(&columns, "NEW")),
        capture_trigger(table, "update", "UPDATE", &snapshot_expr(&columns, "NEW")),
        capture_trigger(table, "delete", "DELETE", &snapshot_expr(&key_column, "OLD")),
    ]
}

/// DDL statements removing the capture triggers for `table`.
pub fn drop_change_capture_ddl(table: &str) -> Vec<String> {
    ["insert", "update", "delete"]
        .iter()
        .map(|op| format!("DROP TRIGGER IF EXISTS {}", quote_identifier(&trigger_name(table, op))))
        .collect()
}
