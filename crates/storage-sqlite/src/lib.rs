//! sheetbridge-storage-sqlite: SQLite adapters for the sync engine.
//!
//! Two repositories over one pooled database:
//!
//! * [`TargetTableRepository`] — mapped access to synced target tables, the
//!   change-capture triggers and the change log they feed, and the
//!   transaction-scoped write tag that keeps sheet-originated writes out of
//!   the table-to-sheet scan.
//! * [`MetadataRepository`] — sync configs, per-config incremental state,
//!   the run history and recorded conflicts.

pub mod db;
mod errors;
mod metadata;
mod models;
mod schema;
mod target;
mod triggers;

pub use db::{create_pool, get_connection, init_schema, SqlitePool};
pub use errors::{Result, StorageError};
pub use metadata::MetadataRepository;
pub use target::TargetTableRepository;
pub use triggers::{change_capture_ddl, drop_change_capture_ddl};
