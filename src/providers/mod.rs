use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::Event;

/// In-memory store for tests.
pub mod in_memory;

/// Filesystem-backed store for local durability.
pub mod fs;

/// A history event together with the wall-clock time it was committed.
/// Timestamps back the status query's created/last-updated fields and play
/// no part in replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub ts_ms: u64,
    pub event: Event,
}

/// Storage-level failures.
///
/// `ConcurrencyConflict` is the optimistic-sequencing signal: the caller's
/// expected append position no longer matches, so it must re-read and retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("instance already exists: {0}")]
    AlreadyExists(String),
    #[error("concurrency conflict on {instance}: expected position {expected}, found {actual}")]
    ConcurrencyConflict {
        instance: String,
        expected: usize,
        actual: usize,
    },
    #[error("storage i/o: {0}")]
    Io(String),
}

/// Append-only, per-instance event log.
///
/// A committed append survives process restart; events for one instance are
/// totally ordered and never deleted in normal operation.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a new, empty instance. Fails with `AlreadyExists` for duplicates.
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError>;

    /// Ordered, immutable record sequence for an instance.
    async fn read(&self, instance: &str) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Optimistic append: commits only if the current history length equals
    /// `expected_len`, otherwise fails with `ConcurrencyConflict`.
    async fn append(&self, instance: &str, expected_len: usize, events: Vec<Event>) -> Result<(), StoreError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Result<Vec<String>, StoreError>;
}

/// Strip timestamps for replay.
pub fn events(records: &[HistoryRecord]) -> Vec<Event> {
    records.iter().map(|r| r.event.clone()).collect()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
