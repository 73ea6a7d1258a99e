//! Lifecycle event sink.
//!
//! Emission is fire-and-forget; the engine never blocks or fails on an
//! observer. Runtime hosts bridge this to their websocket broadcaster.

use serde::Serialize;

use crate::dlq::FailureReason;
use crate::models::SyncDirection;

/// Lifecycle events emitted by workers and the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    CycleStarted {
        config_id: String,
        direction: SyncDirection,
    },
    CycleCompleted {
        config_id: String,
        direction: SyncDirection,
        rows_affected: u64,
        conflicts: u64,
        duration_ms: i64,
    },
    CycleFailed {
        config_id: String,
        direction: SyncDirection,
        error: String,
    },
    ConflictDetected {
        config_id: String,
        row_key: String,
    },
    DeadLettered {
        job_id: String,
        reason: FailureReason,
    },
}

/// Observer contract for lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Sink that writes events to the log.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: SyncEvent) {
        match &event {
            SyncEvent::CycleFailed { config_id, direction, error } => {
                log::warn!("cycle failed config={config_id} direction={} error={error}", direction.as_str());
            }
            other => {
                log::info!("sync event: {}", serde_json::to_string(other).unwrap_or_default());
            }
        }
    }
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: SyncEvent) {}
}
