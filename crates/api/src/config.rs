use std::time::Duration;

use engine::worker::WorkerConfig;
use serde::{Deserialize, Serialize};

/// Passed into [`crate::Scheduler::new`] at construction. Never a process-wide
/// singleton: every caller decides its own config and owns the `Scheduler`
/// it hands it to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_concurrent_downloads: u32,
    pub connections_per_file: u32,
    pub network_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
    pub min_chunk_size: u64,
    pub store_write_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            connections_per_file: 8,
            network_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            exponential_backoff: true,
            min_chunk_size: engine::planner::DEFAULT_MIN_CHUNK_SIZE,
            store_write_interval: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            connections: self.connections_per_file,
            min_chunk_size: self.min_chunk_size,
            timeout: self.network_timeout,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            exponential_backoff: self.exponential_backoff,
        }
    }
}
