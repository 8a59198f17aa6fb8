//! Durable storage for task transcripts
//!
//! Each task gets its own directory holding the API transcript, the UI
//! transcript and the checkpoint-index map. Missing files read as empty;
//! writes go to a temporary file first and are renamed into place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

use crate::error::{Error, Result};
use crate::message::{ApiMessage, UiMessage};

pub const API_HISTORY_FILE: &str = "api_conversation_history.json";
pub const UI_MESSAGES_FILE: &str = "ui_messages.json";
pub const CHECKPOINT_INDEX_FILE: &str = "checkpoint_index.json";

/// Map from checkpoint commit to the request index it was taken at
pub type CheckpointIndexMap = HashMap<String, u64>;

/// Storage collaborator, keyed by task id
#[async_trait]
pub trait TaskStorage: Send + Sync {
    async fn read_api_messages(&self, task_id: &str) -> Result<Vec<ApiMessage>>;
    async fn save_api_messages(&self, task_id: &str, messages: &[ApiMessage]) -> Result<()>;
    async fn read_ui_messages(&self, task_id: &str) -> Result<Vec<UiMessage>>;
    async fn save_ui_messages(&self, task_id: &str, messages: &[UiMessage]) -> Result<()>;
    async fn read_checkpoint_index(&self, task_id: &str) -> Result<CheckpointIndexMap>;
    async fn save_checkpoint_index(&self, task_id: &str, map: &CheckpointIndexMap) -> Result<()>;
}

/// JSON files under `<root>/tasks/<task_id>/`
pub struct FileTaskStorage {
    root: PathBuf,
}

impl FileTaskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("tasks").join(task_id)
    }

    /// Ids of every task with a directory on disk
    pub async fn list_task_ids(&self) -> Result<Vec<String>> {
        let dir = self.root.join("tasks");
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn read_json<T: DeserializeOwned + Default>(&self, task_id: &str, file: &str) -> Result<T> {
        let path = self.task_dir(task_id).join(file);
        match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Storage(format!("Failed to parse {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(Error::Storage(format!("Failed to read {}: {}", path.display(), e))),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, task_id: &str, file: &str, value: &T) -> Result<()> {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create {}: {}", dir.display(), e)))?;
        let content = serde_json::to_string(value)?;
        atomic_write(&dir.join(file), &content).await
    }
}

/// Atomic write using temp file and rename
async fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, content)
        .await
        .map_err(|e| Error::Storage(format!("Failed to write temp file: {}", e)))?;

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("Failed to rename temp file: {}", e)))?;

    Ok(())
}

#[async_trait]
impl TaskStorage for FileTaskStorage {
    async fn read_api_messages(&self, task_id: &str) -> Result<Vec<ApiMessage>> {
        self.read_json(task_id, API_HISTORY_FILE).await
    }

    async fn save_api_messages(&self, task_id: &str, messages: &[ApiMessage]) -> Result<()> {
        self.write_json(task_id, API_HISTORY_FILE, messages).await
    }

    async fn read_ui_messages(&self, task_id: &str) -> Result<Vec<UiMessage>> {
        self.read_json(task_id, UI_MESSAGES_FILE).await
    }

    async fn save_ui_messages(&self, task_id: &str, messages: &[UiMessage]) -> Result<()> {
        self.write_json(task_id, UI_MESSAGES_FILE, messages).await
    }

    async fn read_checkpoint_index(&self, task_id: &str) -> Result<CheckpointIndexMap> {
        self.read_json(task_id, CHECKPOINT_INDEX_FILE).await
    }

    async fn save_checkpoint_index(&self, task_id: &str, map: &CheckpointIndexMap) -> Result<()> {
        self.write_json(task_id, CHECKPOINT_INDEX_FILE, map).await
    }
}

#[derive(Debug, Clone, Default)]
struct TaskRecord {
    api: Vec<ApiMessage>,
    ui: Vec<UiMessage>,
    checkpoints: CheckpointIndexMap,
}

/// In-memory storage for embedding and tests. Can be told to fail the next
/// few writes to exercise retry paths.
#[derive(Clone, Default)]
pub struct MemoryTaskStorage {
    records: Arc<Mutex<HashMap<String, TaskRecord>>>,
    failing_writes: Arc<AtomicU32>,
}

impl MemoryTaskStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a storage error
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Storage("simulated write failure: resource busy".to_string()));
        }
        Ok(())
    }

    fn update(&self, task_id: &str, f: impl FnOnce(&mut TaskRecord)) -> Result<()> {
        self.check_write()?;
        let mut records = self.records.lock();
        f(records.entry(task_id.to_string()).or_default());
        Ok(())
    }

    fn read<T>(&self, task_id: &str, f: impl FnOnce(&TaskRecord) -> T) -> Option<T> {
        self.records.lock().get(task_id).map(f)
    }
}

#[async_trait]
impl TaskStorage for MemoryTaskStorage {
    async fn read_api_messages(&self, task_id: &str) -> Result<Vec<ApiMessage>> {
        Ok(self.read(task_id, |r| r.api.clone()).unwrap_or_default())
    }

    async fn save_api_messages(&self, task_id: &str, messages: &[ApiMessage]) -> Result<()> {
        self.update(task_id, |r| r.api = messages.to_vec())
    }

    async fn read_ui_messages(&self, task_id: &str) -> Result<Vec<UiMessage>> {
        Ok(self.read(task_id, |r| r.ui.clone()).unwrap_or_default())
    }

    async fn save_ui_messages(&self, task_id: &str, messages: &[UiMessage]) -> Result<()> {
        self.update(task_id, |r| r.ui = messages.to_vec())
    }

    async fn read_checkpoint_index(&self, task_id: &str) -> Result<CheckpointIndexMap> {
        Ok(self.read(task_id, |r| r.checkpoints.clone()).unwrap_or_default())
    }

    async fn save_checkpoint_index(&self, task_id: &str, map: &CheckpointIndexMap) -> Result<()> {
        self.update(task_id, |r| r.checkpoints = map.clone())
    }
}
