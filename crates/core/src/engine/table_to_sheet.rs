//! Table-to-spreadsheet worker: drains the change-capture log into the sheet.

use chrono::Utc;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use super::{CycleOutcome, SyncContext};
use crate::detector::row_key;
use crate::errors::Result;
use crate::events::SyncEvent;
use crate::metrics::names;
use crate::models::{
    row_from_json, row_range, CellValue, ChangeOp, RunStatus, SyncConfig, SyncDirection, SyncRun,
    FROM_SHEET_TAG,
};
use crate::ports::{RangeRead, RangeValues};

/// Default change-log scan bound per run.
pub const DEFAULT_CHANGE_LOG_BATCH: i64 = 1000;

/// Planned spreadsheet writes for one run.
#[derive(Debug, Default)]
struct WritePlan {
    /// Row updates keyed by canonical primary key, with the 1-based sheet row.
    updates: HashMap<String, (usize, Vec<CellValue>)>,
    /// Rows to append, in change-log order.
    append_order: Vec<String>,
    appends: HashMap<String, Vec<CellValue>>,
    /// 1-based sheet rows to clear, keyed by canonical primary key.
    clears: HashMap<String, usize>,
}

impl WritePlan {
    fn write_count(&self) -> u64 {
        (self.updates.len() + self.appends.len() + self.clears.len()) as u64
    }
}

pub struct TableToSheetWorker {
    ctx: Arc<SyncContext>,
    batch_limit: i64,
}

impl TableToSheetWorker {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self::with_batch_limit(ctx, DEFAULT_CHANGE_LOG_BATCH)
    }

    pub fn with_batch_limit(ctx: Arc<SyncContext>, batch_limit: i64) -> Self {
        Self { ctx, batch_limit }
    }

    /// Execute one table-to-spreadsheet run for `config`.
    pub async fn run(&self, config: &SyncConfig) -> Result<CycleOutcome> {
        let mut run = SyncRun::begin(&config.id, SyncDirection::TableToSheet);
        self.ctx.metadata.create_run(&run).await?;
        self.ctx.events.emit(SyncEvent::CycleStarted {
            config_id: config.id.clone(),
            direction: SyncDirection::TableToSheet,
        });

        match self.execute(config, &mut run).await {
            Ok((rows_affected, note)) => {
                run.rows_affected = rows_affected;
                if let Some(note) = &note {
                    run.metadata = serde_json::json!({ "note": note });
                }
                run.finish(RunStatus::Success, None);
                self.ctx.metadata.finish_run(&run).await?;
                let duration_ms = run.duration_ms().unwrap_or(0);
                self.ctx.events.emit(SyncEvent::CycleCompleted {
                    config_id: config.id.clone(),
                    direction: SyncDirection::TableToSheet,
                    rows_affected,
                    conflicts: 0,
                    duration_ms,
                });
                self.ctx.metrics.incr_counter(
                    names::CYCLE_TOTAL,
                    &[("direction", "table_to_sheet"), ("status", "success")],
                );
                self.ctx.metrics.observe_histogram(
                    names::CYCLE_DURATION_MS,
                    duration_ms as f64,
                    &[("direction", "table_to_sheet")],
                );
                Ok(CycleOutcome {
                    run_id: run.id,
                    config_id: config.id.clone(),
                    direction: SyncDirection::TableToSheet,
                    status: RunStatus::Success,
                    rows_affected,
                    conflicts: 0,
                    note,
                })
            }
            Err(err) => {
                run.finish(RunStatus::Failed, Some(err.to_string()));
                if let Err(finish_err) = self.ctx.metadata.finish_run(&run).await {
                    warn!("failed to finalize run {}: {finish_err}", run.id);
                }
                self.ctx.events.emit(SyncEvent::CycleFailed {
                    config_id: config.id.clone(),
                    direction: SyncDirection::TableToSheet,
                    error: err.to_string(),
                });
                self.ctx.metrics.incr_counter(
                    names::CYCLE_TOTAL,
                    &[("direction", "table_to_sheet"), ("status", "failed")],
                );
                Err(err)
            }
        }
    }

    async fn execute(&self, config: &SyncConfig, run: &mut SyncRun) -> Result<(u64, Option<String>)> {
        let state = self.ctx.metadata.get_state(&config.id).await?;

        // Loop prevention: rows stamped by the sheet-to-table worker are
        // excluded at the scan, so our own writes never echo back.
        let entries = self
            .ctx
            .tables
            .fetch_change_log(
                &config.target_table,
                FROM_SHEET_TAG,
                state.db_last_change_id,
                self.batch_limit,
            )
            .await?;

        if entries.is_empty() {
            return Ok((0, Some("no changes".to_string())));
        }

        let grid = match self
            .ctx
            .sheets
            .read_range(&config.spreadsheet_id, &config.range, None)
            .await?
        {
            RangeRead::Modified { grid, .. } => grid,
            RangeRead::NotModified { .. } => Vec::new(),
        };

        let key_column = config.mapping.primary_key();

        // 1-based sheet row per key; row 1 is the header. Cleared rows keep
        // their index in the grid but have no key cell, so they read as absent.
        let mut sheet_index: HashMap<String, usize> = HashMap::new();
        for (offset, cells) in grid.iter().enumerate().skip(1) {
            if let Some(value) = cells.first() {
                if !value.is_null() {
                    let key = value.canonical_string();
                    if !key.is_empty() {
                        sheet_index.insert(key, offset + 1);
                    }
                }
            }
        }

        let mut plan = WritePlan::default();
        let mut consumed_ids = Vec::with_capacity(entries.len());
        let mut max_id = state.db_last_change_id;

        for entry in &entries {
            consumed_ids.push(entry.id);
            max_id = max_id.max(entry.id);

            let snapshot = row_from_json(&entry.row_snapshot);
            let Some(key) = row_key(&snapshot, key_column) else {
                warn!(
                    "[{}] change-log entry {} has no usable key, skipping",
                    config.id, entry.id
                );
                continue;
            };

            match entry.op {
                ChangeOp::Insert | ChangeOp::Update => {
                    let cells = config.mapping.cells_from_row(&snapshot);
                    plan.clears.remove(&key);
                    match sheet_index.get(&key) {
                        Some(&row_number) => {
                            plan.appends.remove(&key);
                            plan.append_order.retain(|k| k != &key);
                            plan.updates.insert(key, (row_number, cells));
                        }
                        None => {
                            // An update for a row the sheet has never seen
                            // (or whose row was cleared) becomes an append.
                            plan.updates.remove(&key);
                            if plan.appends.insert(key.clone(), cells).is_none() {
                                plan.append_order.push(key);
                            }
                        }
                    }
                }
                ChangeOp::Delete => {
                    plan.updates.remove(&key);
                    if plan.appends.remove(&key).is_some() {
                        plan.append_order.retain(|k| k != &key);
                    }
                    if let Some(&row_number) = sheet_index.get(&key) {
                        plan.clears.insert(key, row_number);
                    }
                }
            }
        }

        let op_id = format!("t2s:{}:{max_id}", config.id);
        run.metadata = serde_json::json!({ "opId": op_id });
        if !self.ctx.idempotency.check_and_mark(&op_id).await? {
            info!("[{}] cycle {op_id} already processed, skipping", config.id);
            return Ok((0, Some("cycle already processed".to_string())));
        }

        if let Err(err) = self.flush_plan(config, &plan, &consumed_ids).await {
            // Release the gate; a retry of this cycle must be allowed to
            // repeat the writes that just failed.
            let _ = self.ctx.idempotency.remove(&op_id).await;
            return Err(err);
        }

        let rows_affected = plan.write_count();
        self.ctx
            .idempotency
            .mark_processed(
                &op_id,
                serde_json::json!({
                    "updates": plan.updates.len(),
                    "appends": plan.appends.len(),
                    "clears": plan.clears.len(),
                    "lastChangeId": max_id,
                }),
            )
            .await?;

        self.ctx
            .metadata
            .record_table_sync(&config.id, Utc::now(), max_id)
            .await?;

        Ok((rows_affected, None))
    }

    /// Issue the planned spreadsheet writes, then consume the change-log rows.
    async fn flush_plan(
        &self,
        config: &SyncConfig,
        plan: &WritePlan,
        consumed_ids: &[i64],
    ) -> Result<()> {
        if !plan.updates.is_empty() {
            let mut updates: Vec<(&String, &(usize, Vec<CellValue>))> =
                plan.updates.iter().collect();
            updates.sort_by_key(|(_, (row_number, _))| *row_number);
            let batch: Vec<RangeValues> = updates
                .into_iter()
                .map(|(_, (row_number, cells))| RangeValues {
                    range: row_range(&config.range, &config.mapping, *row_number),
                    values: vec![cells.clone()],
                })
                .collect();
            self.ctx
                .sheets
                .batch_update(&config.spreadsheet_id, batch)
                .await?;
        }

        if !plan.append_order.is_empty() {
            let rows: Vec<Vec<CellValue>> = plan
                .append_order
                .iter()
                .filter_map(|key| plan.appends.get(key).cloned())
                .collect();
            self.ctx
                .sheets
                .append_rows(&config.spreadsheet_id, &config.range, rows)
                .await?;
        }

        // Deletion is emulated: the platform cannot remove rows through this
        // surface, so the row's cells are cleared and the row stays behind.
        let mut clears: Vec<(&String, &usize)> = plan.clears.iter().collect();
        clears.sort_by_key(|(_, row_number)| **row_number);
        for (_, &row_number) in clears {
            self.ctx
                .sheets
                .clear_range(
                    &config.spreadsheet_id,
                    &row_range(&config.range, &config.mapping, row_number),
                )
                .await?;
        }

        self.ctx.tables.mark_changes_processed(consumed_ids).await?;
        Ok(())
    }
}
