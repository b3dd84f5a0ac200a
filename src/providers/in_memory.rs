use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{now_ms, HistoryRecord, HistoryStore, StoreError};
use crate::Event;

/// In-memory history store for tests. Append is atomic under one lock, so the
/// optimistic position check and the write cannot interleave.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, Vec<HistoryRecord>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(instance) {
            return Err(StoreError::AlreadyExists(instance.to_string()));
        }
        g.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        let g = self.inner.lock().await;
        g.get(instance)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(instance.to_string()))
    }

    async fn append(&self, instance: &str, expected_len: usize, events: Vec<Event>) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        let records = g
            .get_mut(instance)
            .ok_or_else(|| StoreError::NotFound(instance.to_string()))?;
        if records.len() != expected_len {
            return Err(StoreError::ConcurrencyConflict {
                instance: instance.to_string(),
                expected: expected_len,
                actual: records.len(),
            });
        }
        let ts_ms = now_ms();
        records.extend(events.into_iter().map(|event| HistoryRecord { ts_ms, event }));
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().await.keys().cloned().collect())
    }
}
