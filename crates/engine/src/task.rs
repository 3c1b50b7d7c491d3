use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a task, distinct at the type level from a filename or URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous byte interval of the remote resource, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub start: u64,
    pub end: u64,
    pub downloaded: u64,
}

impl Chunk {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            downloaded: 0,
        }
    }

    /// Number of bytes this chunk covers.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.downloaded)
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.size()
    }

    /// Absolute offset to resume this chunk from.
    pub fn resume_position(&self) -> u64 {
        self.start + self.downloaded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Downloading,
    Paused,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub save_directory: String,
    pub filename: String,
    pub total_size: Option<u64>,
    pub downloaded_size: u64,
    pub status: TaskStatus,
    pub speed_bps: f64,
    pub connections: u32,
    pub chunks: Vec<Chunk>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl Task {
    pub fn new(url: String, save_directory: String, filename: String, connections: u32) -> Self {
        Self {
            id: TaskId::new(),
            url,
            save_directory,
            filename,
            total_size: None,
            downloaded_size: 0,
            status: TaskStatus::Waiting,
            speed_bps: 0.0,
            connections,
            chunks: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        match self.total_size {
            Some(total) if total > 0 => (self.downloaded_size as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    pub fn final_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.save_directory).join(&self.filename)
    }

    pub fn temp_path(&self) -> std::path::PathBuf {
        let mut name = self.filename.clone();
        name.push_str(".tmp");
        std::path::Path::new(&self.save_directory).join(name)
    }

    /// Recomputes `downloaded_size` from per-chunk counters, keeping the accounting
    /// invariant (`downloaded_size == sum(chunk.downloaded)`) after any chunk update.
    pub fn resync_downloaded(&mut self) {
        if !self.chunks.is_empty() {
            self.downloaded_size = self.chunks.iter().map(|c| c.downloaded).sum();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_resume_position_accounts_for_partial_download() {
        let mut chunk = Chunk::new(100, 199);
        chunk.downloaded = 40;
        assert_eq!(chunk.resume_position(), 140);
        assert_eq!(chunk.remaining(), 60);
        assert!(!chunk.is_complete());
    }

    #[test]
    fn chunk_is_complete_when_downloaded_covers_size() {
        let mut chunk = Chunk::new(0, 9);
        chunk.downloaded = 10;
        assert!(chunk.is_complete());
    }

    #[test]
    fn task_resync_downloaded_sums_chunks() {
        let mut task = Task::new(
            "https://example.com/f".into(),
            "/tmp".into(),
            "f".into(),
            2,
        );
        task.chunks = vec![Chunk::new(0, 9), Chunk::new(10, 19)];
        task.chunks[0].downloaded = 10;
        task.chunks[1].downloaded = 3;
        task.resync_downloaded();
        assert_eq!(task.downloaded_size, 13);
    }
}
