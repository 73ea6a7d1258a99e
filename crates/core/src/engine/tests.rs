//! Engine tests against in-memory ports.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::detector::{row_key, ChangeSet};
use crate::dlq::{DeadLetterSink, FailureReason};
use crate::errors::{Result, SyncError};
use crate::events::{EventSink, SyncEvent};
use crate::idempotency::MemoryIdempotencyStore;
use crate::metrics::NullMetricSink;
use crate::models::{
    row_to_json, CellValue, ChangeLogEntry, ChangeOp, ColumnMapping, ConflictPolicy,
    ConflictRecord, ConflictWinner, Row, RunStatus, SyncConfig, SyncRun, SyncState, EXTERNAL_TAG,
};
use crate::ports::{MetadataStore, RangeRead, RangeValues, SpreadsheetPort, TargetTableStore};
use crate::retry::RetryOptions;

// ─── in-memory ports ─────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryMetadata {
    configs: Mutex<HashMap<String, SyncConfig>>,
    states: Mutex<HashMap<String, SyncState>>,
    runs: Mutex<Vec<SyncRun>>,
    conflicts: Mutex<Vec<ConflictRecord>>,
}

impl MemoryMetadata {
    fn insert_config(&self, config: SyncConfig) {
        self.configs.lock().unwrap().insert(config.id.clone(), config);
    }

    fn state(&self, config_id: &str) -> SyncState {
        self.states.lock().unwrap().get(config_id).cloned().unwrap_or_default()
    }

    fn set_state(&self, config_id: &str, state: SyncState) {
        self.states.lock().unwrap().insert(config_id.to_string(), state);
    }

    fn runs(&self) -> Vec<SyncRun> {
        self.runs.lock().unwrap().clone()
    }

    fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadata {
    async fn list_active_configs(&self) -> Result<Vec<SyncConfig>> {
        Ok(self
            .configs
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.active)
            .cloned()
            .collect())
    }

    async fn get_config(&self, config_id: &str) -> Result<Option<SyncConfig>> {
        Ok(self.configs.lock().unwrap().get(config_id).cloned())
    }

    async fn get_state(&self, config_id: &str) -> Result<SyncState> {
        Ok(self.state(config_id))
    }

    async fn record_sheet_sync(
        &self,
        config_id: &str,
        at: DateTime<Utc>,
        etag: Option<String>,
    ) -> Result<()> {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(config_id.to_string()).or_default();
        state.last_sheet_sync_at = Some(at);
        state.sheet_etag = etag;
        Ok(())
    }

    async fn record_table_sync(
        &self,
        config_id: &str,
        at: DateTime<Utc>,
        last_change_id: i64,
    ) -> Result<()> {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(config_id.to_string()).or_default();
        state.last_db_sync_at = Some(at);
        state.db_last_change_id = last_change_id;
        Ok(())
    }

    async fn create_run(&self, run: &SyncRun) -> Result<()> {
        self.runs.lock().unwrap().push(run.clone());
        Ok(())
    }

    async fn finish_run(&self, run: &SyncRun) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(slot) = runs.iter_mut().find(|r| r.id == run.id) {
            *slot = run.clone();
        }
        Ok(())
    }

    async fn record_conflict(&self, record: &ConflictRecord) -> Result<()> {
        self.conflicts.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Table store whose mutations feed a change log, standing in for the
/// database triggers.
struct MemoryTable {
    key_column: String,
    rows: Mutex<Vec<Row>>,
    change_log: Mutex<Vec<ChangeLogEntry>>,
    next_change_id: AtomicI64,
    /// When set, the next apply fails once with a retryable error.
    fail_next_apply: AtomicBool,
}

impl MemoryTable {
    fn new(key_column: &str) -> Self {
        Self {
            key_column: key_column.to_string(),
            rows: Mutex::new(Vec::new()),
            change_log: Mutex::new(Vec::new()),
            next_change_id: AtomicI64::new(1),
            fail_next_apply: AtomicBool::new(false),
        }
    }

    fn rows(&self) -> Vec<Row> {
        self.rows.lock().unwrap().clone()
    }

    fn log(&self) -> Vec<ChangeLogEntry> {
        self.change_log.lock().unwrap().clone()
    }

    /// Overwrite rows without touching the change log (for staging test
    /// fixtures that should look like pre-existing data).
    fn seed_rows(&self, rows: Vec<Row>) {
        *self.rows.lock().unwrap() = rows;
    }

    fn append_log(&self, op: ChangeOp, snapshot: serde_json::Value, tag: &str, at: DateTime<Utc>) -> i64 {
        let id = self.next_change_id.fetch_add(1, Ordering::SeqCst);
        self.change_log.lock().unwrap().push(ChangeLogEntry {
            id,
            table_name: "people".to_string(),
            op,
            row_snapshot: snapshot,
            source_tag: Some(tag.to_string()),
            changed_at: at,
            processed: false,
        });
        id
    }

    /// Simulate an external client writing through the triggers.
    fn external_upsert(&self, row: Row, at: DateTime<Utc>) -> i64 {
        let key = row_key(&row, &self.key_column).expect("fixture row has a key");
        let mut rows = self.rows.lock().unwrap();
        let op = match rows
            .iter_mut()
            .find(|r| row_key(r, &self.key_column).as_deref() == Some(key.as_str()))
        {
            Some(existing) => {
                *existing = row.clone();
                ChangeOp::Update
            }
            None => {
                rows.push(row.clone());
                ChangeOp::Insert
            }
        };
        drop(rows);
        self.append_log(op, row_to_json(&row), EXTERNAL_TAG, at)
    }

    fn external_delete(&self, key: &str, at: DateTime<Utc>) -> i64 {
        self.rows
            .lock()
            .unwrap()
            .retain(|r| row_key(r, &self.key_column).as_deref() != Some(key));
        let snapshot = serde_json::json!({ (self.key_column.as_str()): key });
        self.append_log(ChangeOp::Delete, snapshot, EXTERNAL_TAG, at)
    }
}

#[async_trait]
impl TargetTableStore for MemoryTable {
    async fn fetch_rows(&self, _table: &str, _mapping: &ColumnMapping) -> Result<Vec<Row>> {
        Ok(self.rows())
    }

    async fn apply_changes(
        &self,
        _table: &str,
        _mapping: &ColumnMapping,
        changes: &ChangeSet,
        write_tag: Option<&str>,
    ) -> Result<u64> {
        if self.fail_next_apply.swap(false, Ordering::SeqCst) {
            return Err(SyncError::database("injected write failure"));
        }
        let tag = write_tag.unwrap_or(EXTERNAL_TAG);
        let now = Utc::now();
        let mut affected = 0;

        for row in &changes.inserts {
            let key = row_key(row, &self.key_column).expect("insert row has a key");
            let mut rows = self.rows.lock().unwrap();
            let op = match rows
                .iter_mut()
                .find(|r| row_key(r, &self.key_column).as_deref() == Some(key.as_str()))
            {
                Some(existing) => {
                    *existing = row.clone();
                    ChangeOp::Update
                }
                None => {
                    rows.push(row.clone());
                    ChangeOp::Insert
                }
            };
            drop(rows);
            self.append_log(op, row_to_json(row), tag, now);
            affected += 1;
        }

        for update in &changes.updates {
            let mut rows = self.rows.lock().unwrap();
            if let Some(existing) = rows
                .iter_mut()
                .find(|r| row_key(r, &self.key_column).as_deref() == Some(update.key.as_str()))
            {
                *existing = update.row.clone();
                drop(rows);
                self.append_log(ChangeOp::Update, row_to_json(&update.row), tag, now);
                affected += 1;
            }
        }

        for key in &changes.deletes {
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|r| row_key(r, &self.key_column).as_deref() != Some(key.as_str()));
            let removed = rows.len() < before;
            drop(rows);
            if removed {
                let snapshot = serde_json::json!({ (self.key_column.as_str()): key });
                self.append_log(ChangeOp::Delete, snapshot, tag, now);
                affected += 1;
            }
        }

        Ok(affected)
    }

    async fn fetch_change_log(
        &self,
        _table: &str,
        exclude_tag: &str,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<ChangeLogEntry>> {
        let mut entries: Vec<ChangeLogEntry> = self
            .change_log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                !e.processed
                    && e.id > after_id
                    && e.source_tag.as_deref() != Some(exclude_tag)
            })
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn fetch_change_log_since(
        &self,
        _table: &str,
        exclude_tag: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeLogEntry>> {
        let mut entries: Vec<ChangeLogEntry> = self
            .change_log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.changed_at > since && e.source_tag.as_deref() != Some(exclude_tag))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn mark_changes_processed(&self, ids: &[i64]) -> Result<()> {
        let mut entries = self.change_log.lock().unwrap();
        for entry in entries.iter_mut() {
            if ids.contains(&entry.id) {
                entry.processed = true;
            }
        }
        Ok(())
    }
}

/// Spreadsheet with a version-counter ETag.
struct MemorySheet {
    grid: Mutex<Vec<Vec<CellValue>>>,
    version: AtomicI64,
    read_calls: AtomicU32,
    /// When set, every call fails with this HTTP status.
    fail_status: Mutex<Option<u16>>,
}

impl MemorySheet {
    fn new(grid: Vec<Vec<CellValue>>) -> Self {
        Self {
            grid: Mutex::new(grid),
            version: AtomicI64::new(1),
            read_calls: AtomicU32::new(0),
            fail_status: Mutex::new(None),
        }
    }

    fn etag(&self) -> String {
        format!("v{}", self.version.load(Ordering::SeqCst))
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn grid(&self) -> Vec<Vec<CellValue>> {
        self.grid.lock().unwrap().clone()
    }

    fn set_grid(&self, grid: Vec<Vec<CellValue>>) {
        *self.grid.lock().unwrap() = grid;
        self.bump();
    }

    fn fail_with(&self, status: u16) {
        *self.fail_status.lock().unwrap() = Some(status);
    }

    fn check_failure(&self) -> Result<()> {
        match *self.fail_status.lock().unwrap() {
            Some(status) => Err(SyncError::api(status, "injected failure")),
            None => Ok(()),
        }
    }

    fn row_number(range: &str) -> usize {
        let span = range.split('!').next_back().unwrap_or(range);
        let digits: String = span
            .chars()
            .skip_while(|c| c.is_ascii_alphabetic())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().expect("range has a row number")
    }
}

#[async_trait]
impl SpreadsheetPort for MemorySheet {
    async fn read_range(
        &self,
        _spreadsheet_id: &str,
        _range: &str,
        if_none_match: Option<&str>,
    ) -> Result<RangeRead> {
        self.check_failure()?;
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let etag = self.etag();
        if if_none_match == Some(etag.as_str()) {
            return Ok(RangeRead::NotModified { etag: Some(etag) });
        }
        Ok(RangeRead::Modified {
            grid: self.grid(),
            etag: Some(etag),
        })
    }

    async fn batch_update(
        &self,
        _spreadsheet_id: &str,
        updates: Vec<RangeValues>,
    ) -> Result<Option<String>> {
        self.check_failure()?;
        let mut grid = self.grid.lock().unwrap();
        for update in updates {
            let row_number = Self::row_number(&update.range);
            while grid.len() < row_number {
                grid.push(Vec::new());
            }
            grid[row_number - 1] = update.values.into_iter().next().unwrap_or_default();
        }
        drop(grid);
        self.bump();
        Ok(Some(self.etag()))
    }

    async fn append_rows(
        &self,
        _spreadsheet_id: &str,
        _range: &str,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<Option<String>> {
        self.check_failure()?;
        self.grid.lock().unwrap().extend(rows);
        self.bump();
        Ok(Some(self.etag()))
    }

    async fn clear_range(&self, _spreadsheet_id: &str, range: &str) -> Result<Option<String>> {
        self.check_failure()?;
        let row_number = Self::row_number(range);
        let mut grid = self.grid.lock().unwrap();
        if let Some(cells) = grid.get_mut(row_number - 1) {
            for cell in cells.iter_mut() {
                *cell = CellValue::Null;
            }
        }
        drop(grid);
        self.bump();
        Ok(Some(self.etag()))
    }
}

#[derive(Default)]
struct RecordingEvents {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingEvents {
    fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingEvents {
    fn emit(&self, event: SyncEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ─── fixtures ────────────────────────────────────────────────────────────

struct Harness {
    ctx: Arc<SyncContext>,
    sheet: Arc<MemorySheet>,
    table: Arc<MemoryTable>,
    metadata: Arc<MemoryMetadata>,
    events: Arc<RecordingEvents>,
}

fn people_grid() -> Vec<Vec<CellValue>> {
    vec![
        vec!["id".into(), "name".into(), "email".into()],
        vec![CellValue::Integer(1), "Alice".into(), "alice@x".into()],
        vec![CellValue::Integer(2), "Bob".into(), "bob@x".into()],
    ]
}

fn people_config(policy: ConflictPolicy) -> SyncConfig {
    SyncConfig {
        id: "cfg-1".to_string(),
        name: "people".to_string(),
        spreadsheet_id: "sheet-1".to_string(),
        range: "Sheet1!A1:C100".to_string(),
        target_table: "people".to_string(),
        mapping: ColumnMapping::from_pairs(&[("A", "id"), ("B", "name"), ("C", "email")]).unwrap(),
        conflict_policy: policy,
        interval_secs: 10,
        active: true,
    }
}

fn person(id: i64, name: &str, email: &str) -> Row {
    [
        ("id".to_string(), CellValue::Integer(id)),
        ("name".to_string(), CellValue::Text(name.to_string())),
        ("email".to_string(), CellValue::Text(email.to_string())),
    ]
    .into_iter()
    .collect()
}

fn harness(grid: Vec<Vec<CellValue>>, policy: ConflictPolicy) -> Harness {
    let sheet = Arc::new(MemorySheet::new(grid));
    let table = Arc::new(MemoryTable::new("id"));
    let metadata = Arc::new(MemoryMetadata::default());
    let events = Arc::new(RecordingEvents::default());
    metadata.insert_config(people_config(policy));

    let ctx = Arc::new(SyncContext {
        metadata: metadata.clone(),
        tables: table.clone(),
        sheets: sheet.clone(),
        idempotency: Arc::new(MemoryIdempotencyStore::new()),
        events: events.clone(),
        metrics: Arc::new(NullMetricSink),
        dead_letters: Arc::new(DeadLetterSink::default()),
    });

    Harness { ctx, sheet, table, metadata, events }
}

fn fast_retry(max_attempts: u32) -> RetryOptions {
    RetryOptions {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        jitter: false,
    }
}

// ─── sheet-to-table ──────────────────────────────────────────────────────

#[tokio::test]
async fn initial_import_fills_empty_table() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let worker = SheetToTableWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    let outcome = worker.run(&config).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.rows_affected, 2);

    let rows = h.table.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.contains(&person(1, "Alice", "alice@x")));
    assert!(rows.contains(&person(2, "Bob", "bob@x")));

    let state = h.metadata.state("cfg-1");
    assert!(state.last_sheet_sync_at.is_some());
    assert_eq!(state.sheet_etag.as_deref(), Some("v1"));

    let completed = h.events.events().into_iter().any(|e| {
        matches!(e, SyncEvent::CycleCompleted { rows_affected: 2, .. })
    });
    assert!(completed, "expected a cycle_completed event with rowsAffected=2");
}

#[tokio::test]
async fn unchanged_sheet_short_circuits_on_etag() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let worker = SheetToTableWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    worker.run(&config).await.unwrap();
    let outcome = worker.run(&config).await.unwrap();

    assert_eq!(outcome.rows_affected, 0);
    assert_eq!(outcome.note.as_deref(), Some("sheet not modified"));
    assert_eq!(h.table.rows().len(), 2);
    // No tagged writes beyond the first import.
    assert_eq!(h.table.log().len(), 2);
}

#[tokio::test]
async fn rerun_with_same_content_is_idempotent() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let worker = SheetToTableWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    worker.run(&config).await.unwrap();
    let before = h.table.rows();

    // Convergent state: a second pass over identical inputs finds nothing.
    let outcome = worker.run(&config).await.unwrap();
    assert_eq!(outcome.rows_affected, 0);
    assert_eq!(h.table.rows(), before);
}

#[tokio::test]
async fn duplicate_cycle_is_blocked_by_idempotency_guard() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let worker = SheetToTableWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    worker.run(&config).await.unwrap();

    // Replay the same inputs: wipe the table behind the engine's back and
    // clear the stored ETag so the conditional read misses.
    h.table.seed_rows(Vec::new());
    let mut state = h.metadata.state("cfg-1");
    state.sheet_etag = None;
    h.metadata.set_state("cfg-1", state);

    let outcome = worker.run(&config).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.rows_affected, 0);
    assert_eq!(outcome.note.as_deref(), Some("cycle already processed"));
    assert!(h.table.rows().is_empty(), "guarded cycle must not write");
}

#[tokio::test]
async fn failed_apply_releases_the_gate_for_a_retry() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let worker = SheetToTableWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    h.table.fail_next_apply.store(true, Ordering::SeqCst);
    assert!(worker.run(&config).await.is_err());
    assert!(h.table.rows().is_empty());

    // Same sheet content, same operation id; the failed attempt must not
    // block the retry.
    let outcome = worker.run(&config).await.unwrap();
    assert_eq!(outcome.rows_affected, 2);
    assert_eq!(h.table.rows().len(), 2);
}

#[tokio::test]
async fn rows_without_primary_key_are_skipped() {
    let mut grid = people_grid();
    grid.push(vec![CellValue::Null, "Ghost".into(), "ghost@x".into()]);
    let h = harness(grid, ConflictPolicy::LastWriteWins);
    let worker = SheetToTableWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    let outcome = worker.run(&config).await.unwrap();
    assert_eq!(outcome.rows_affected, 2);
    assert_eq!(h.table.rows().len(), 2);
}

#[tokio::test]
async fn header_only_sheet_deletes_table_rows() {
    let h = harness(vec![people_grid()[0].clone()], ConflictPolicy::LastWriteWins);
    h.table.seed_rows(vec![person(1, "Alice", "alice@x")]);
    let worker = SheetToTableWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    let outcome = worker.run(&config).await.unwrap();
    assert_eq!(outcome.rows_affected, 1);
    assert!(h.table.rows().is_empty());
}

// ─── table-to-sheet ──────────────────────────────────────────────────────

#[tokio::test]
async fn table_side_update_reaches_the_sheet() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let s2t = SheetToTableWorker::new(h.ctx.clone());
    let t2s = TableToSheetWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    s2t.run(&config).await.unwrap();
    let change_id = h.table.external_upsert(person(1, "Alicia", "alice@x"), Utc::now());

    let outcome = t2s.run(&config).await.unwrap();
    assert_eq!(outcome.rows_affected, 1);

    let grid = h.sheet.grid();
    assert_eq!(grid[1][1], CellValue::Text("Alicia".to_string()));

    let entry = h.table.log().into_iter().find(|e| e.id == change_id).unwrap();
    assert!(entry.processed);
    assert_eq!(h.metadata.state("cfg-1").db_last_change_id, change_id);
}

#[tokio::test]
async fn table_insert_appends_and_delete_clears() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let s2t = SheetToTableWorker::new(h.ctx.clone());
    let t2s = TableToSheetWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    s2t.run(&config).await.unwrap();
    h.table.external_upsert(person(3, "Carol", "carol@x"), Utc::now());
    h.table.external_delete("1", Utc::now());

    let outcome = t2s.run(&config).await.unwrap();
    assert_eq!(outcome.rows_affected, 2);

    let grid = h.sheet.grid();
    // Row 2 (id=1) is cleared in place; the row itself remains.
    assert!(grid[1].iter().all(|cell| cell.is_null()));
    // Carol appended at the bottom.
    let last = grid.last().unwrap();
    assert_eq!(last[0], CellValue::Integer(3));
    assert_eq!(last[1], CellValue::Text("Carol".to_string()));
}

#[tokio::test]
async fn sheet_writes_are_never_echoed_back() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let s2t = SheetToTableWorker::new(h.ctx.clone());
    let t2s = TableToSheetWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    s2t.run(&config).await.unwrap();
    let grid_before = h.sheet.grid();

    let outcome = t2s.run(&config).await.unwrap();
    assert_eq!(outcome.rows_affected, 0);
    assert_eq!(outcome.note.as_deref(), Some("no changes"));
    assert_eq!(h.sheet.grid(), grid_before);

    // The sheet-tagged entries were never consumed.
    assert!(h.table.log().iter().all(|e| !e.processed));
}

#[tokio::test]
async fn change_log_batch_bound_is_respected() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let s2t = SheetToTableWorker::new(h.ctx.clone());
    let t2s = TableToSheetWorker::with_batch_limit(h.ctx.clone(), 2);
    let config = people_config(ConflictPolicy::LastWriteWins);

    s2t.run(&config).await.unwrap();
    let first = h.table.external_upsert(person(1, "A1", "alice@x"), Utc::now());
    let second = h.table.external_upsert(person(2, "B1", "bob@x"), Utc::now());
    let third = h.table.external_upsert(person(1, "A2", "alice@x"), Utc::now());

    t2s.run(&config).await.unwrap();
    assert_eq!(h.metadata.state("cfg-1").db_last_change_id, second);
    let processed: Vec<i64> = h.table.log().iter().filter(|e| e.processed).map(|e| e.id).collect();
    assert_eq!(processed, vec![first, second]);

    t2s.run(&config).await.unwrap();
    assert_eq!(h.metadata.state("cfg-1").db_last_change_id, third);
    assert_eq!(h.sheet.grid()[1][1], CellValue::Text("A2".to_string()));
}

// ─── conflicts ───────────────────────────────────────────────────────────

#[tokio::test]
async fn lww_conflict_later_table_edit_wins_and_propagates_back() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let s2t = SheetToTableWorker::new(h.ctx.clone());
    let t2s = TableToSheetWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    s2t.run(&config).await.unwrap();

    // Sheet edits id=2 to Robert; the table later edits it to Bobby.
    let mut grid = h.sheet.grid();
    grid[2][1] = CellValue::Text("Robert".to_string());
    h.sheet.set_grid(grid);
    let table_edit_at = Utc::now() + ChronoDuration::hours(1);
    h.table.external_upsert(person(2, "Bobby", "bob@x"), table_edit_at);

    let outcome = s2t.run(&config).await.unwrap();
    assert_eq!(outcome.conflicts, 1);
    assert_eq!(outcome.rows_affected, 0, "table win drops the sheet change");

    let conflicts = h.metadata.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].winner, ConflictWinner::Table);
    assert!(conflicts[0].resolved_at.is_some());

    // Table keeps Bobby, and the next table-to-sheet cycle propagates it.
    assert!(h.table.rows().contains(&person(2, "Bobby", "bob@x")));
    t2s.run(&config).await.unwrap();
    assert_eq!(h.sheet.grid()[2][1], CellValue::Text("Bobby".to_string()));
}

#[tokio::test]
async fn manual_policy_persists_unresolved_conflict_and_writes_nothing() {
    let h = harness(people_grid(), ConflictPolicy::Manual);
    let s2t = SheetToTableWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::Manual);

    s2t.run(&config).await.unwrap();

    let mut grid = h.sheet.grid();
    grid[2][1] = CellValue::Text("Robert".to_string());
    h.sheet.set_grid(grid);
    h.table.external_upsert(person(2, "Bobby", "bob@x"), Utc::now());

    let outcome = s2t.run(&config).await.unwrap();
    assert_eq!(outcome.conflicts, 1);
    assert_eq!(outcome.rows_affected, 0);
    assert_eq!(outcome.status, RunStatus::Success);

    let conflicts = h.metadata.conflicts();
    assert_eq!(conflicts[0].winner, ConflictWinner::Manual);
    assert!(conflicts[0].resolved_at.is_none());
    assert!(h.table.rows().contains(&person(2, "Bobby", "bob@x")));
}

// ─── orchestrator ────────────────────────────────────────────────────────

fn orchestrator(h: &Harness, retry: RetryOptions) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        h.ctx.clone(),
        OrchestratorOptions {
            tick_interval: Duration::from_millis(50),
            tick_jitter: Duration::ZERO,
            retry,
            change_log_batch: 1000,
        },
    ))
}

#[tokio::test]
async fn tick_runs_both_directions_in_order() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let orch = orchestrator(&h, fast_retry(2));

    orch.run_once().await;

    assert_eq!(h.table.rows().len(), 2);
    let runs = h.metadata.runs();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].direction, crate::models::SyncDirection::SheetToTable);
    assert_eq!(runs[1].direction, crate::models::SyncDirection::TableToSheet);
    assert!(runs.iter().all(|r| r.status == RunStatus::Success));
}

#[tokio::test]
async fn fresh_state_skips_directions_inside_the_interval() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let now = Utc::now();
    h.metadata.set_state(
        "cfg-1",
        SyncState {
            last_sheet_sync_at: Some(now),
            last_db_sync_at: Some(now),
            sheet_etag: Some("v1".to_string()),
            db_last_change_id: 0,
        },
    );
    let orch = orchestrator(&h, fast_retry(2));

    orch.run_once().await;

    assert!(h.metadata.runs().is_empty());
    assert_eq!(h.sheet.read_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn manual_trigger_bypasses_the_interval() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let now = Utc::now();
    h.metadata.set_state(
        "cfg-1",
        SyncState {
            last_sheet_sync_at: Some(now),
            last_db_sync_at: Some(now),
            sheet_etag: None,
            db_last_change_id: 0,
        },
    );
    let orch = orchestrator(&h, fast_retry(2));

    let outcomes = orch.run_config_now("cfg-1").await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(h.table.rows().len(), 2);
}

#[tokio::test]
async fn exhausted_retries_land_in_the_dead_letter_sink() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    h.sheet.fail_with(503);
    let orch = orchestrator(&h, fast_retry(3));

    orch.run_once().await;

    // The table-to-sheet direction never reaches the sheet (the change log
    // is empty), so only sheet-to-table dead-letters.
    assert_eq!(h.ctx.dead_letters.depth(), 1);
    let entries = h.ctx.dead_letters.snapshot();
    assert_eq!(entries[0].failure_reason, FailureReason::MaxRetries);
    assert_eq!(entries[0].attempts_made, 3);

    // Each attempt leaves a failed history row.
    let failed_runs = h
        .metadata
        .runs()
        .into_iter()
        .filter(|r| r.status == RunStatus::Failed)
        .count();
    assert_eq!(failed_runs, 3);

    let dead_lettered = h
        .events
        .events()
        .into_iter()
        .filter(|e| matches!(e, SyncEvent::DeadLettered { .. }))
        .count();
    assert_eq!(dead_lettered, 1);
}

#[tokio::test]
async fn terminal_errors_dead_letter_without_retrying() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    h.sheet.fail_with(403);
    let orch = orchestrator(&h, fast_retry(5));

    orch.run_once().await;

    let entries = h.ctx.dead_letters.snapshot();
    // Table-to-sheet never reaches the sheet (the change log is empty), so
    // only the sheet-to-table direction fails.
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].failure_reason, FailureReason::NonRetryable);
    assert_eq!(entries[0].attempts_made, 1);
}

#[tokio::test]
async fn start_runs_immediately_and_stop_halts_ticks() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let orch = orchestrator(&h, fast_retry(2));

    orch.start();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(orch.is_running());
    assert_eq!(h.table.rows().len(), 2);

    orch.stop();
    assert!(!orch.is_running());
}

#[tokio::test]
async fn round_trip_update_converges() {
    let h = harness(people_grid(), ConflictPolicy::LastWriteWins);
    let s2t = SheetToTableWorker::new(h.ctx.clone());
    let t2s = TableToSheetWorker::new(h.ctx.clone());
    let config = people_config(ConflictPolicy::LastWriteWins);

    // Sheet row propagates in, the table column is updated, and the update
    // comes back out to the sheet.
    s2t.run(&config).await.unwrap();
    t2s.run(&config).await.unwrap();
    h.table.external_upsert(person(2, "Bobby", "bob@x"), Utc::now());
    t2s.run(&config).await.unwrap();

    assert_eq!(h.sheet.grid()[2][1], CellValue::Text("Bobby".to_string()));

    // With no further external writes the system is quiescent.
    let s2t_outcome = s2t.run(&config).await.unwrap();
    let t2s_outcome = t2s.run(&config).await.unwrap();
    assert_eq!(s2t_outcome.rows_affected, 0);
    assert_eq!(t2s_outcome.rows_affected, 0);
}
