//! Sync configuration.

use serde::{Deserialize, Serialize};

use super::mapping::ColumnMapping;
use crate::errors::Result;

/// How conflicting concurrent edits are arbitrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    LastWriteWins,
    SheetWins,
    TableWins,
    Manual,
}

/// One spreadsheet-to-table sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub id: String,
    pub name: String,
    pub spreadsheet_id: String,
    /// A1 range including the header row, e.g. `Sheet1!A1:D500`.
    pub range: String,
    pub target_table: String,
    pub mapping: ColumnMapping,
    pub conflict_policy: ConflictPolicy,
    /// Minimum seconds between cycles in either direction.
    pub interval_secs: u32,
    pub active: bool,
}

impl SyncConfig {
    /// Validate the configuration before a cycle touches it.
    ///
    /// Mapping invariants are enforced at construction; this re-checks them
    /// for configs deserialized from external storage.
    pub fn validate(&self) -> Result<()> {
        self.mapping.validate()?;
        if self.interval_secs == 0 {
            return Err(crate::errors::SyncError::config(format!(
                "config '{}' has a zero sync interval",
                self.id
            )));
        }
        Ok(())
    }
}
