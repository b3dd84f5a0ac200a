use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::{fs, sync::Mutex};

use super::{now_ms, HistoryRecord, HistoryStore, StoreError};
use crate::Event;

/// Filesystem-backed history store writing one JSONL file per instance.
///
/// The write lock serializes the read-check-append sequence within this
/// process; the length check still rejects appends from any other writer that
/// slipped in between. Appends are flushed and fsynced before returning, so a
/// committed event survives process restart.
pub struct FsHistoryStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsHistoryStore {
    /// Create a store rooted at the given directory.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let _ = std::fs::create_dir_all(&path);
        Self {
            root: path,
            write_lock: Mutex::new(()),
        }
    }

    fn inst_path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{instance}.jsonl"))
    }

    async fn read_records(&self, instance: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        let path = self.inst_path(instance);
        let data = match fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(instance.to_string()));
            }
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str::<HistoryRecord>(line)
                .map_err(|e| StoreError::Io(format!("corrupt history line for {instance}: {e}")))?;
            out.push(record);
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let _g = self.write_lock.lock().await;
        let path = self.inst_path(instance);
        if fs::try_exists(&path).await.map_err(|e| StoreError::Io(e.to_string()))? {
            return Err(StoreError::AlreadyExists(instance.to_string()));
        }
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let file = fs::File::create(&path).await.map_err(|e| StoreError::Io(e.to_string()))?;
        file.sync_all().await.map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        self.read_records(instance).await
    }

    async fn append(&self, instance: &str, expected_len: usize, events: Vec<Event>) -> Result<(), StoreError> {
        let _g = self.write_lock.lock().await;
        let existing = self.read_records(instance).await?;
        if existing.len() != expected_len {
            return Err(StoreError::ConcurrencyConflict {
                instance: instance.to_string(),
                expected: expected_len,
                actual: existing.len(),
            });
        }
        let ts_ms = now_ms();
        let mut buf = String::new();
        for event in events {
            let record = HistoryRecord { ts_ms, event };
            let line = serde_json::to_string(&record).map_err(|e| StoreError::Io(e.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.inst_path(instance))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.flush().await.map_err(|e| StoreError::Io(e.to_string()))?;
        file.sync_all().await.map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        while let Some(entry) = dir.next_entry().await.map_err(|e| StoreError::Io(e.to_string()))? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    out.push(stem.to_string());
                }
            }
        }
        Ok(out)
    }
}
