//! Column mapping between spreadsheet columns and target-table columns.

use serde::{Deserialize, Serialize};

use super::cell::{CellValue, Row};
use crate::errors::{Result, SyncError};

/// One spreadsheet-column-to-table-column association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnBinding {
    /// Spreadsheet column letter (`A`, `B`, ..., `AA`, ...).
    pub letter: String,
    /// Target-table column name.
    pub column: String,
}

/// Ordered mapping from spreadsheet column letters to table columns.
///
/// The binding for letter `A` designates the primary key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMapping {
    bindings: Vec<ColumnBinding>,
}

/// 0-based column index for a letter sequence (`A` = 0, `Z` = 25, `AA` = 26).
pub fn letter_to_index(letter: &str) -> Result<usize> {
    let mut index: usize = 0;
    if letter.is_empty() {
        return Err(SyncError::mapping("empty column letter"));
    }
    for byte in letter.bytes() {
        if !byte.is_ascii_alphabetic() {
            return Err(SyncError::mapping(format!("invalid column letter '{letter}'")));
        }
        let value = (byte.to_ascii_uppercase() - b'A') as usize + 1;
        index = index
            .checked_mul(26)
            .and_then(|i| i.checked_add(value))
            .ok_or_else(|| SyncError::mapping(format!("column letter '{letter}' out of range")))?;
    }
    Ok(index - 1)
}

/// Column letters for a 0-based index (`0` = `A`, `26` = `AA`).
pub fn index_to_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).expect("column letters are always valid UTF-8")
}

impl ColumnMapping {
    /// Build a mapping from `(letter, column)` pairs, validating the
    /// invariants: unique contiguous letters starting at `A`, non-empty
    /// column names.
    pub fn new(pairs: Vec<(String, String)>) -> Result<Self> {
        if pairs.is_empty() {
            return Err(SyncError::mapping("column mapping is empty"));
        }

        let mut bindings = Vec::with_capacity(pairs.len());
        for (position, (letter, column)) in pairs.into_iter().enumerate() {
            let letter = letter.trim().to_ascii_uppercase();
            let index = letter_to_index(&letter)?;
            if index != position {
                return Err(SyncError::mapping(format!(
                    "column letters must be contiguous from A; found '{letter}' at position {position}"
                )));
            }
            let column = column.trim().to_string();
            if column.is_empty() {
                return Err(SyncError::mapping(format!("empty column name for letter '{letter}'")));
            }
            if bindings.iter().any(|b: &ColumnBinding| b.column == column) {
                return Err(SyncError::mapping(format!("duplicate column name '{column}'")));
            }
            bindings.push(ColumnBinding { letter, column });
        }

        Ok(Self { bindings })
    }

    /// Convenience constructor from string slices.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Result<Self> {
        Self::new(
            pairs
                .iter()
                .map(|(letter, column)| (letter.to_string(), column.to_string()))
                .collect(),
        )
    }

    /// Re-check the construction invariants.
    ///
    /// Deserialization is transparent, so mappings loaded from external
    /// storage must be validated before a cycle trusts them.
    pub fn validate(&self) -> Result<()> {
        Self::new(
            self.bindings
                .iter()
                .map(|b| (b.letter.clone(), b.column.clone()))
                .collect(),
        )
        .map(|_| ())
    }

    /// The primary key column (the letter-`A` binding).
    pub fn primary_key(&self) -> &str {
        &self.bindings[0].column
    }

    /// Target-table column names in spreadsheet order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.column.as_str())
    }

    /// Number of mapped columns.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Letter of the last mapped column.
    pub fn last_letter(&self) -> &str {
        &self.bindings[self.bindings.len() - 1].letter
    }

    /// Project a 2-D cell grid into rows, treating row 0 as the header.
    ///
    /// Cells beyond the mapped width are dropped; short rows are padded
    /// with nulls. Fully empty rows are skipped.
    pub fn rows_from_grid(&self, grid: &[Vec<CellValue>]) -> Vec<Row> {
        grid.iter()
            .skip(1)
            .filter_map(|cells| {
                let mut row = Row::new();
                let mut any = false;
                for (position, binding) in self.bindings.iter().enumerate() {
                    let value = cells.get(position).cloned().unwrap_or(CellValue::Null);
                    if !value.is_null() {
                        any = true;
                    }
                    row.insert(binding.column.clone(), value);
                }
                any.then_some(row)
            })
            .collect()
    }

    /// Flatten a row into its ordered cell vector for writing back.
    pub fn cells_from_row(&self, row: &Row) -> Vec<CellValue> {
        self.bindings
            .iter()
            .map(|binding| row.get(&binding.column).cloned().unwrap_or(CellValue::Null))
            .collect()
    }
}

/// The sheet-name prefix of an A1 range (`Sheet1!A1:D50` -> `Sheet1`).
pub fn sheet_prefix(range: &str) -> Option<&str> {
    range.split_once('!').map(|(sheet, _)| sheet)
}

/// A1 range covering one data row across the mapped columns.
///
/// `row_index` is 1-based and includes the header row, matching the row
/// numbers shown by the spreadsheet UI.
pub fn row_range(range: &str, mapping: &ColumnMapping, row_index: usize) -> String {
    let span = format!("A{row_index}:{}{row_index}", mapping.last_letter());
    match sheet_prefix(range) {
        Some(sheet) => format!("{sheet}!{span}"),
        None => span,
    }
}
