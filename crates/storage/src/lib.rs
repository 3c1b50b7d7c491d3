//! Crash-safe JSON persistence for the set of known tasks, mirroring the
//! write-temp-then-rename discipline used elsewhere in the engine.

pub mod record;

use std::path::{Path, PathBuf};

use engine::task::Task;
use record::TaskRecord;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Default location under the user's data directory: `<data_dir>/fluxdm/tasks.json`.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("fluxdm")
        .join("tasks.json")
}

pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the store once at startup. A missing file is an empty store; a
    /// corrupt file is logged and treated as empty rather than failing.
    pub fn load(&self) -> Vec<Task> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no task store found, starting empty");
                return Vec::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read task store, starting empty");
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Vec<TaskRecord>>(&bytes) {
            Ok(records) => records.into_iter().map(TaskRecord::into_task).collect(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "task store is corrupt, starting empty");
                Vec::new()
            }
        }
    }

    /// Writes the full task set via a temp-file-then-rename so a crash mid-write
    /// never leaves a truncated store behind.
    pub fn save(&self, tasks: &[Task]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let records: Vec<TaskRecord> = tasks.iter().map(TaskRecord::from).collect();
        let json = serde_json::to_vec_pretty(&records)?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), count = records.len(), "task store saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::task::{Chunk, TaskStatus};

    fn sample_task() -> Task {
        let mut task = Task::new(
            "https://example.com/f.zip".into(),
            "/tmp/downloads".into(),
            "f.zip".into(),
            4,
        );
        task.total_size = Some(1000);
        task.downloaded_size = 500;
        task.chunks = vec![Chunk {
            start: 0,
            end: 999,
            downloaded: 500,
        }];
        task.status = TaskStatus::Downloading;
        task
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn corrupt_file_loads_as_empty_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = TaskStore::new(path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn round_trip_preserves_chunk_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks.json"));
        let task = sample_task();
        store.save(&[task.clone()]).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].chunks[0].downloaded, 500);
        assert_eq!(loaded[0].downloaded_size, 500);
    }

    #[test]
    fn downloading_status_demoted_to_paused_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks.json"));
        store.save(&[sample_task()]).unwrap();

        let loaded = store.load();
        assert_eq!(loaded[0].status, TaskStatus::Paused);
    }
}
