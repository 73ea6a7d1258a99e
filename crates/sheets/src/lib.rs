//! sheetbridge-sheets: spreadsheet API adapter.
//!
//! Implements `sheetbridge_core::ports::SpreadsheetPort` over the remote
//! values API. Rate limiting and circuit breaking are applied by outer
//! wrappers; transient failures surface as retryable errors for the
//! engine's retry policy.

mod client;
mod error;

pub use client::SheetsClient;
pub use error::{Result, SheetsError};
