//! Process-scoped component registry.
//!
//! Everything the workers and orchestrator touch is constructed at startup
//! and handed through this context; there is no module-level state.

use std::sync::Arc;

use crate::dlq::DeadLetterSink;
use crate::events::EventSink;
use crate::idempotency::IdempotencyStore;
use crate::metrics::MetricSink;
use crate::ports::{MetadataStore, SpreadsheetPort, TargetTableStore};

pub struct SyncContext {
    pub metadata: Arc<dyn MetadataStore>,
    pub tables: Arc<dyn TargetTableStore>,
    pub sheets: Arc<dyn SpreadsheetPort>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<dyn MetricSink>,
    pub dead_letters: Arc<DeadLetterSink>,
}

impl SyncContext {
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        Arc::clone(&self.metadata)
    }

    pub fn tables(&self) -> Arc<dyn TargetTableStore> {
        Arc::clone(&self.tables)
    }

    pub fn sheets(&self) -> Arc<dyn SpreadsheetPort> {
        Arc::clone(&self.sheets)
    }

    pub fn idempotency(&self) -> Arc<dyn IdempotencyStore> {
        Arc::clone(&self.idempotency)
    }

    pub fn events(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.events)
    }

    pub fn metrics(&self) -> Arc<dyn MetricSink> {
        Arc::clone(&self.metrics)
    }

    pub fn dead_letters(&self) -> Arc<DeadLetterSink> {
        Arc::clone(&self.dead_letters)
    }
}
