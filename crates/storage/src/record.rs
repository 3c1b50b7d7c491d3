//! At-rest serialization of a [`Task`], forward-compatible with unknown
//! fields so older stores keep loading after the schema grows.

use chrono::{DateTime, Utc};
use engine::task::{Chunk, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub url: String,
    pub save_directory: String,
    pub filename: String,
    pub total_size: Option<u64>,
    pub downloaded_size: u64,
    pub status: TaskStatus,
    pub connections: u32,
    pub chunks: Vec<Chunk>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            url: task.url.clone(),
            save_directory: task.save_directory.clone(),
            filename: task.filename.clone(),
            total_size: task.total_size,
            downloaded_size: task.downloaded_size,
            status: task.status,
            connections: task.connections,
            chunks: task.chunks.clone(),
            error: task.error.clone(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            retry_count: task.retry_count,
        }
    }
}

impl TaskRecord {
    /// Reconstructs a `Task`, demoting a persisted `Downloading` status to
    /// `Paused` -- a task can never be found mid-flight right after a
    /// process restart, since no worker survives the restart.
    pub fn into_task(self) -> Task {
        let status = match self.status {
            TaskStatus::Downloading => TaskStatus::Paused,
            other => other,
        };
        Task {
            id: self.id,
            url: self.url,
            save_directory: self.save_directory,
            filename: self.filename,
            total_size: self.total_size,
            downloaded_size: self.downloaded_size,
            status,
            speed_bps: 0.0,
            connections: self.connections,
            chunks: self.chunks,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            retry_count: self.retry_count,
        }
    }
}
