//! Periodic driver over all active sync configurations.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{CycleOutcome, SheetToTableWorker, SyncContext, TableToSheetWorker};
use crate::dlq::DeadLetterEntry;
use crate::errors::{Result, SyncError};
use crate::events::SyncEvent;
use crate::metrics::names;
use crate::models::{SyncConfig, SyncDirection};
use crate::retry::{failure_reason, retry, RetryOptions};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Interval between scheduler ticks.
    pub tick_interval: Duration,
    /// Maximum random extra delay added to each tick so a fleet of engines
    /// does not thunder against the remote API in lockstep.
    pub tick_jitter: Duration,
    pub retry: RetryOptions,
    /// Change-log scan bound per table-to-sheet run.
    pub change_log_batch: i64,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            tick_jitter: Duration::from_secs(1),
            retry: RetryOptions::default(),
            change_log_batch: super::table_to_sheet::DEFAULT_CHANGE_LOG_BATCH,
        }
    }
}

/// Whether a direction is due: never synced, or the interval has elapsed.
pub fn direction_due(last_sync: Option<DateTime<Utc>>, interval_secs: u32, now: DateTime<Utc>) -> bool {
    match last_sync {
        None => true,
        Some(last) => (now - last).num_seconds() >= i64::from(interval_secs),
    }
}

pub struct Orchestrator {
    ctx: Arc<SyncContext>,
    options: OrchestratorOptions,
    sheet_to_table: SheetToTableWorker,
    table_to_sheet: TableToSheetWorker,
    running: AtomicBool,
    stop_signal: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<SyncContext>, options: OrchestratorOptions) -> Self {
        Self {
            sheet_to_table: SheetToTableWorker::new(Arc::clone(&ctx)),
            table_to_sheet: TableToSheetWorker::with_batch_limit(
                Arc::clone(&ctx),
                options.change_log_batch,
            ),
            ctx,
            options,
            running: AtomicBool::new(false),
            stop_signal: Notify::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launch the periodic tick; the first cycle runs immediately.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "orchestrator starting (tick {}ms)",
            self.options.tick_interval.as_millis()
        );

        let orchestrator = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                if !orchestrator.running.load(Ordering::SeqCst) {
                    break;
                }
                orchestrator.run_once().await;

                let jitter_ms = orchestrator.options.tick_jitter.as_millis() as u64;
                let extra = if jitter_ms > 0 {
                    rand::thread_rng().gen_range(0..=jitter_ms)
                } else {
                    0
                };
                let pause = orchestrator.options.tick_interval + Duration::from_millis(extra);

                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = orchestrator.stop_signal.notified() => break,
                }
            }
            info!("orchestrator stopped");
        });

        *self.handle.lock().expect("orchestrator handle lock poisoned") = Some(task);
    }

    /// Clear the running flag. The flag is honored between ticks; a cycle
    /// already in flight runs to completion.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stop_signal.notify_waiters();
        }
        let _ = self
            .handle
            .lock()
            .expect("orchestrator handle lock poisoned")
            .take();
    }

    /// One scheduler pass over every active config.
    pub async fn run_once(&self) {
        let configs = match self.ctx.metadata.list_active_configs().await {
            Ok(configs) => configs,
            Err(err) => {
                error!("failed to list active configs: {err}");
                return;
            }
        };

        for config in configs {
            if let Err(err) = config.validate() {
                warn!("skipping config '{}': {err}", config.id);
                continue;
            }
            self.run_due_directions(&config).await;
        }
    }

    async fn run_due_directions(&self, config: &SyncConfig) {
        let state = match self.ctx.metadata.get_state(&config.id).await {
            Ok(state) => state,
            Err(err) => {
                warn!("failed to read state for '{}': {err}", config.id);
                return;
            }
        };
        let now = Utc::now();

        // Sheet-to-table must precede table-to-sheet within a cycle;
        // reversing them could re-emit rows this cycle is about to write.
        if direction_due(state.last_sheet_sync_at, config.interval_secs, now) {
            if let Err(err) = self.run_with_retry(config, SyncDirection::SheetToTable).await {
                self.dead_letter(config, SyncDirection::SheetToTable, err);
            }
        }
        if direction_due(state.last_db_sync_at, config.interval_secs, now) {
            if let Err(err) = self.run_with_retry(config, SyncDirection::TableToSheet).await {
                self.dead_letter(config, SyncDirection::TableToSheet, err);
            }
        }
    }

    async fn run_with_retry(
        &self,
        config: &SyncConfig,
        direction: SyncDirection,
    ) -> Result<CycleOutcome> {
        let context = format!("{}:{}", config.id, direction.as_str());
        match direction {
            SyncDirection::SheetToTable => {
                retry(|| self.sheet_to_table.run(config), &self.options.retry, &context).await
            }
            SyncDirection::TableToSheet => {
                retry(|| self.table_to_sheet.run(config), &self.options.retry, &context).await
            }
        }
    }

    /// Record a job that exhausted its retries and move on to the next
    /// config; one failing sync never aborts the tick.
    fn dead_letter(&self, config: &SyncConfig, direction: SyncDirection, err: SyncError) {
        let reason = failure_reason(&err);
        let attempts = if err.is_retryable() {
            self.options.retry.max_attempts
        } else {
            1
        };
        let job_id = format!("{}:{}:{}", config.id, direction.as_str(), Uuid::new_v4());
        error!(
            "sync job {job_id} dead-lettered after {attempts} attempt(s): {err}"
        );

        let now = Utc::now();
        self.ctx.dead_letters.push(DeadLetterEntry {
            job_id: job_id.clone(),
            payload: serde_json::json!({
                "configId": config.id,
                "direction": direction.as_str(),
            }),
            error: err.to_string(),
            attempts_made: attempts,
            first_attempt_at: now,
            last_attempt_at: now,
            failure_reason: reason,
        });
        self.ctx.events.emit(SyncEvent::DeadLettered { job_id, reason });
        self.ctx.metrics.set_gauge(
            names::DEAD_LETTER_DEPTH,
            self.ctx.dead_letters.depth() as f64,
            &[],
        );
    }

    /// Run both directions for one config immediately, bypassing the
    /// interval check. Sheet-to-table runs first.
    pub async fn run_config_now(&self, config_id: &str) -> Result<Vec<CycleOutcome>> {
        let config = self.load_config(config_id).await?;
        let mut outcomes = Vec::with_capacity(2);
        outcomes.push(self.run_with_retry(&config, SyncDirection::SheetToTable).await?);
        outcomes.push(self.run_with_retry(&config, SyncDirection::TableToSheet).await?);
        Ok(outcomes)
    }

    /// Run a single direction for one config immediately.
    pub async fn run_direction_now(
        &self,
        config_id: &str,
        direction: SyncDirection,
    ) -> Result<CycleOutcome> {
        let config = self.load_config(config_id).await?;
        self.run_with_retry(&config, direction).await
    }

    async fn load_config(&self, config_id: &str) -> Result<SyncConfig> {
        let config = self
            .ctx
            .metadata
            .get_config(config_id)
            .await?
            .ok_or_else(|| SyncError::config(format!("unknown sync config '{config_id}'")))?;
        config.validate()?;
        Ok(config)
    }
}
