//! Bounded dead-letter sink for jobs that exhausted their retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Why a job landed in the dead-letter sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxRetries,
    NonRetryable,
    Timeout,
}

/// One dead-lettered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub job_id: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts_made: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub failure_reason: FailureReason,
}

/// FIFO sink bounded at `capacity`; the oldest entry is evicted when full.
#[derive(Debug)]
pub struct DeadLetterSink {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    capacity: usize,
}

pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1000;

impl Default for DeadLetterSink {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_LETTER_CAPACITY)
    }
}

impl DeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Push an entry, evicting the oldest when the bound is exceeded.
    /// Returns the evicted entry, if any.
    pub fn push(&self, entry: DeadLetterEntry) -> Option<DeadLetterEntry> {
        let mut entries = self.entries.lock().expect("dead-letter sink lock poisoned");
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(entry);
        evicted
    }

    /// Number of entries currently held.
    pub fn depth(&self) -> usize {
        self.entries.lock().expect("dead-letter sink lock poisoned").len()
    }

    /// Snapshot of the entries, oldest first.
    pub fn snapshot(&self) -> Vec<DeadLetterEntry> {
        self.entries
            .lock()
            .expect("dead-letter sink lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_id: &str) -> DeadLetterEntry {
        let now = Utc::now();
        DeadLetterEntry {
            job_id: job_id.to_string(),
            payload: serde_json::json!({"configId": "cfg-1"}),
            error: "remote API error (503): unavailable".to_string(),
            attempts_made: 3,
            first_attempt_at: now,
            last_attempt_at: now,
            failure_reason: FailureReason::MaxRetries,
        }
    }

    #[test]
    fn keeps_fifo_order() {
        let sink = DeadLetterSink::new(10);
        sink.push(entry("a"));
        sink.push(entry("b"));
        let jobs: Vec<String> = sink.snapshot().into_iter().map(|e| e.job_id).collect();
        assert_eq!(jobs, vec!["a", "b"]);
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let sink = DeadLetterSink::new(1000);
        for i in 0..1001 {
            sink.push(entry(&format!("job-{i}")));
        }
        assert_eq!(sink.depth(), 1000);
        let snapshot = sink.snapshot();
        assert_eq!(snapshot.first().unwrap().job_id, "job-1");
        assert_eq!(snapshot.last().unwrap().job_id, "job-1000");
    }
}
