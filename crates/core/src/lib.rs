//! sheetbridge-core: bidirectional spreadsheet/table sync engine.
//!
//! The engine keeps an external spreadsheet range continuously consistent
//! with a relational table under a declarative column mapping. Changes
//! propagate in both directions on a periodic cycle; concurrent edits are
//! arbitrated by a configurable conflict policy, and every run is audited.
//!
//! Adapters (the spreadsheet API client, the target-database store and the
//! metadata store) plug in through the traits in [`ports`]; see the
//! `sheetbridge-sheets` and `sheetbridge-storage-sqlite` crates for the
//! stock implementations.

pub mod conflict;
pub mod detector;
pub mod dlq;
pub mod engine;
pub mod errors;
pub mod events;
pub mod idempotency;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod retry;

pub use errors::{Result, RetryClass, SyncError};
