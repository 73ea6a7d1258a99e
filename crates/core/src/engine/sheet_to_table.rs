//! Spreadsheet-to-table worker: one direction of one cycle.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::{CycleOutcome, SyncContext};
use crate::conflict::{apply_resolutions, detect_conflicts, resolve_all};
use crate::detector::{detect_changes, ChangeSet};
use crate::errors::Result;
use crate::events::SyncEvent;
use crate::metrics::names;
use crate::models::{RunStatus, SyncConfig, SyncDirection, SyncRun, FROM_SHEET_TAG};
use crate::ports::RangeRead;

/// Intermediate result of a successful pass, folded into the run record.
struct PassSummary {
    rows_affected: u64,
    conflicts: u64,
    note: Option<String>,
}

impl PassSummary {
    fn noop(note: &str) -> Self {
        Self {
            rows_affected: 0,
            conflicts: 0,
            note: Some(note.to_string()),
        }
    }
}

pub struct SheetToTableWorker {
    ctx: Arc<SyncContext>,
}

impl SheetToTableWorker {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Execute one spreadsheet-to-table run for `config`.
    ///
    /// The run is recorded as `Running` before any I/O; every exit path
    /// finalizes it. Errors are re-raised to the caller after the history
    /// row is written.
    pub async fn run(&self, config: &SyncConfig) -> Result<CycleOutcome> {
        let mut run = SyncRun::begin(&config.id, SyncDirection::SheetToTable);
        self.ctx.metadata.create_run(&run).await?;
        self.ctx.events.emit(SyncEvent::CycleStarted {
            config_id: config.id.clone(),
            direction: SyncDirection::SheetToTable,
        });

        match self.execute(config, &mut run).await {
            Ok(summary) => {
                run.rows_affected = summary.rows_affected;
                run.conflicts_detected = summary.conflicts;
                if let Some(note) = &summary.note {
                    run.metadata = serde_json::json!({ "note": note });
                }
                run.finish(RunStatus::Success, None);
                self.ctx.metadata.finish_run(&run).await?;
                let duration_ms = run.duration_ms().unwrap_or(0);
                self.ctx.events.emit(SyncEvent::CycleCompleted {
                    config_id: config.id.clone(),
                    direction: SyncDirection::SheetToTable,
                    rows_affected: summary.rows_affected,
                    conflicts: summary.conflicts,
                    duration_ms,
                });
                self.ctx.metrics.incr_counter(
                    names::CYCLE_TOTAL,
                    &[("direction", "sheet_to_table"), ("status", "success")],
                );
                self.ctx.metrics.observe_histogram(
                    names::CYCLE_DURATION_MS,
                    duration_ms as f64,
                    &[("direction", "sheet_to_table")],
                );
                Ok(CycleOutcome {
                    run_id: run.id,
                    config_id: config.id.clone(),
                    direction: SyncDirection::SheetToTable,
                    status: RunStatus::Success,
                    rows_affected: summary.rows_affected,
                    conflicts: summary.conflicts,
                    note: summary.note,
                })
            }
            Err(err) => {
                run.finish(RunStatus::Failed, Some(err.to_string()));
                if let Err(finish_err) = self.ctx.metadata.finish_run(&run).await {
                    warn!("failed to finalize run {}: {finish_err}", run.id);
                }
                self.ctx.events.emit(SyncEvent::CycleFailed {
                    config_id: config.id.clone(),
                    direction: SyncDirection::SheetToTable,
                    error: err.to_string(),
                });
                self.ctx.metrics.incr_counter(
                    names::CYCLE_TOTAL,
                    &[("direction", "sheet_to_table"), ("status", "failed")],
                );
                Err(err)
            }
        }
    }

    async fn execute(&self, config: &SyncConfig, run: &mut SyncRun) -> Result<PassSummary> {
        let state = self.ctx.metadata.get_state(&config.id).await?;

        let read = self
            .ctx
            .sheets
            .read_range(&config.spreadsheet_id, &config.range, state.sheet_etag.as_deref())
            .await?;

        let (grid, etag) = match read {
            RangeRead::NotModified { etag } => {
                debug!("[{}] sheet unchanged (etag match)", config.id);
                let etag = etag.or(state.sheet_etag);
                self.ctx
                    .metadata
                    .record_sheet_sync(&config.id, Utc::now(), etag)
                    .await?;
                return Ok(PassSummary::noop("sheet not modified"));
            }
            RangeRead::Modified { grid, etag } => (grid, etag),
        };

        if grid.is_empty() {
            warn!("[{}] sheet range {} returned no cells, skipping", config.id, config.range);
            self.ctx
                .metadata
                .record_sheet_sync(&config.id, Utc::now(), etag)
                .await?;
            return Ok(PassSummary::noop("empty sheet"));
        }

        let sheet_rows = config.mapping.rows_from_grid(&grid);
        let table_rows = self
            .ctx
            .tables
            .fetch_rows(&config.target_table, &config.mapping)
            .await?;

        let key_column = config.mapping.primary_key();
        let mut changes = detect_changes(&sheet_rows, &table_rows, key_column, &HashSet::new());
        if changes.is_empty() {
            self.ctx
                .metadata
                .record_sheet_sync(&config.id, Utc::now(), etag)
                .await?;
            return Ok(PassSummary::noop("no changes"));
        }

        // Table-side edits since the last table-to-sheet sync are the other
        // half of a potential conflict; sheet-originated rows are excluded so
        // our own earlier writes cannot conflict with themselves.
        let since = state.last_db_sync_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let table_changes = self
            .ctx
            .tables
            .fetch_change_log_since(&config.target_table, FROM_SHEET_TAG, since)
            .await?;

        let conflicts = detect_conflicts(&changes, &table_changes, key_column, None);
        let resolved = resolve_all(config.conflict_policy, conflicts);
        for resolution in &resolved {
            let record = resolution.to_record(&config.id, config.conflict_policy);
            self.ctx.metadata.record_conflict(&record).await?;
            self.ctx.events.emit(SyncEvent::ConflictDetected {
                config_id: config.id.clone(),
                row_key: resolution.conflict.key.clone(),
            });
            self.ctx.metrics.incr_counter(
                names::CONFLICTS_TOTAL,
                &[("policy", policy_label(config.conflict_policy))],
            );
        }
        let conflict_count = resolved.len() as u64;
        changes = apply_resolutions(changes, &resolved, key_column);

        if changes.is_empty() {
            self.ctx
                .metadata
                .record_sheet_sync(&config.id, Utc::now(), etag)
                .await?;
            return Ok(PassSummary {
                rows_affected: 0,
                conflicts: conflict_count,
                note: Some("all changes dropped by conflict resolution".to_string()),
            });
        }

        let op_id = cycle_op_id(&config.id, etag.as_deref(), &changes);
        run.metadata = serde_json::json!({ "opId": op_id });
        if !self.ctx.idempotency.check_and_mark(&op_id).await? {
            info!("[{}] cycle {op_id} already processed, skipping", config.id);
            return Ok(PassSummary {
                rows_affected: 0,
                conflicts: conflict_count,
                note: Some("cycle already processed".to_string()),
            });
        }

        let rows_affected = match self
            .ctx
            .tables
            .apply_changes(&config.target_table, &config.mapping, &changes, Some(FROM_SHEET_TAG))
            .await
        {
            Ok(rows_affected) => rows_affected,
            Err(err) => {
                // Release the gate; a retry of this cycle must be allowed to
                // apply the writes that just failed.
                let _ = self.ctx.idempotency.remove(&op_id).await;
                return Err(err);
            }
        };

        self.ctx
            .idempotency
            .mark_processed(
                &op_id,
                serde_json::json!({
                    "inserts": changes.inserts.len(),
                    "updates": changes.updates.len(),
                    "deletes": changes.deletes.len(),
                    "rowsAffected": rows_affected,
                }),
            )
            .await?;

        self.ctx
            .metadata
            .record_sheet_sync(&config.id, Utc::now(), etag)
            .await?;

        Ok(PassSummary {
            rows_affected,
            conflicts: conflict_count,
            note: None,
        })
    }
}

fn policy_label(policy: crate::models::ConflictPolicy) -> &'static str {
    match policy {
        crate::models::ConflictPolicy::LastWriteWins => "last_write_wins",
        crate::models::ConflictPolicy::SheetWins => "sheet_wins",
        crate::models::ConflictPolicy::TableWins => "table_wins",
        crate::models::ConflictPolicy::Manual => "manual",
    }
}

/// Operation id for one sheet-to-table cycle.
///
/// Keyed on the observed ETag when the sheet reports one, otherwise on a
/// digest of the change set, so a double-ticked cycle over the same input
/// maps to the same id.
fn cycle_op_id(config_id: &str, etag: Option<&str>, changes: &ChangeSet) -> String {
    match etag {
        Some(etag) => format!("s2t:{config_id}:{etag}"),
        None => {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            for row in &changes.inserts {
                for (column, value) in row {
                    column.hash(&mut hasher);
                    value.canonical_string().hash(&mut hasher);
                }
            }
            for update in &changes.updates {
                update.key.hash(&mut hasher);
                for (column, value) in &update.row {
                    column.hash(&mut hasher);
                    value.canonical_string().hash(&mut hasher);
                }
            }
            for key in &changes.deletes {
                key.hash(&mut hasher);
            }
            format!("s2t:{config_id}:{:016x}", hasher.finish())
        }
    }
}
