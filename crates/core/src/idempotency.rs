//! Idempotency guard for replayed cycles.
//!
//! Workers derive an operation id per cycle and direction; `check_and_mark`
//! is the single atomic gate that rejects a cycle the engine already ran
//! (e.g. an orchestrator double-tick under clock skew).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::Result;

/// Keys are namespaced so a shared store can hold other data.
pub const IDEMPOTENCY_KEY_PREFIX: &str = "idempotency:";

/// Entries live for 24 hours.
pub const IDEMPOTENCY_TTL_HOURS: i64 = 24;

/// Keyed set with set-if-absent semantics and a TTL.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically record `op_id`; returns `true` iff the id was new.
    async fn check_and_mark(&self, op_id: &str) -> Result<bool>;

    async fn is_processed(&self, op_id: &str) -> Result<bool>;

    /// Attach result metadata to an already-marked id.
    async fn mark_processed(&self, op_id: &str, metadata: serde_json::Value) -> Result<()>;

    async fn get_metadata(&self, op_id: &str) -> Result<Option<serde_json::Value>>;

    /// Release a marked id. Workers call this when the guarded work fails
    /// after the gate was taken, so a retry of the same cycle can pass.
    async fn remove(&self, op_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    expires_at: DateTime<Utc>,
    metadata: serde_json::Value,
}

/// Process-local idempotency store.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn storage_key(op_id: &str) -> String {
        format!("{IDEMPOTENCY_KEY_PREFIX}{op_id}")
    }

    fn prune(entries: &mut HashMap<String, StoredEntry>) {
        let now = Utc::now();
        entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn check_and_mark(&self, op_id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().expect("idempotency lock poisoned");
        Self::prune(&mut entries);
        let key = Self::storage_key(op_id);
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(
            key,
            StoredEntry {
                expires_at: Utc::now() + Duration::hours(IDEMPOTENCY_TTL_HOURS),
                metadata: serde_json::Value::Null,
            },
        );
        Ok(true)
    }

    async fn is_processed(&self, op_id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().expect("idempotency lock poisoned");
        Self::prune(&mut entries);
        Ok(entries.contains_key(&Self::storage_key(op_id)))
    }

    async fn mark_processed(&self, op_id: &str, metadata: serde_json::Value) -> Result<()> {
        let mut entries = self.entries.lock().expect("idempotency lock poisoned");
        let expires_at = Utc::now() + Duration::hours(IDEMPOTENCY_TTL_HOURS);
        entries.insert(Self::storage_key(op_id), StoredEntry { expires_at, metadata });
        Ok(())
    }

    async fn get_metadata(&self, op_id: &str) -> Result<Option<serde_json::Value>> {
        let mut entries = self.entries.lock().expect("idempotency lock poisoned");
        Self::prune(&mut entries);
        Ok(entries
            .get(&Self::storage_key(op_id))
            .map(|entry| entry.metadata.clone())
            .filter(|metadata| !metadata.is_null()))
    }

    async fn remove(&self, op_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("idempotency lock poisoned");
        entries.remove(&Self::storage_key(op_id));
        Ok(())
    }
}
