//! Drives a single [`Task`] to completion, paused, stopped, or failed, per the
//! probe -> plan -> fetch -> verify -> rename pipeline.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{EngineError, EngineResult};
use crate::http;
use crate::planner;
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub connections: u32,
    pub min_chunk_size: u64,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connections: 8,
            min_chunk_size: planner::DEFAULT_MIN_CHUNK_SIZE,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            exponential_backoff: true,
        }
    }
}

/// Cooperative pause/stop signal shared between a worker and its caller.
#[derive(Debug, Clone, Default)]
pub struct WorkerControl {
    pause: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn request_resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub type ProgressCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// Outcome of running a task to a quiescent point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Paused,
    Stopped,
}

struct ProgressThrottle {
    last_emit: Instant,
    last_bytes: u64,
}

/// Runs `task` to completion, pause, stop, or failure. The shared lock lets
/// chunk fetchers and the progress throttle mutate the same record; the
/// caller is expected to hold the returned (possibly mutated) task afterward.
pub async fn run_task(
    task: Arc<Mutex<Task>>,
    client: Client,
    config: WorkerConfig,
    control: WorkerControl,
    on_progress: ProgressCallback,
) -> EngineResult<Outcome> {
    let task_id = { task.lock().await.id };
    let span = info_span!("task_worker", task_id = %task_id);
    run_task_inner(task, client, config, control, on_progress)
        .instrument(span)
        .await
}

async fn run_task_inner(
    task: Arc<Mutex<Task>>,
    client: Client,
    config: WorkerConfig,
    control: WorkerControl,
    on_progress: ProgressCallback,
) -> EngineResult<Outcome> {
    let (url, save_directory, filename, existing_chunks, connections) = {
        let t = task.lock().await;
        (
            t.url.clone(),
            t.save_directory.clone(),
            t.filename.clone(),
            t.chunks.clone(),
            t.connections.max(1),
        )
    };

    // Probe, unless this is a resume with chunks already planned.
    let (total_size, ranged_mode) = if !existing_chunks.is_empty() {
        let total = existing_chunks.last().map(|c| c.end + 1);
        let all_ranged = existing_chunks.len() > 1;
        (total, all_ranged)
    } else {
        let info = http::probe(&client, &url, config.timeout).await?;
        let ranged = info.accepts_ranges && info.total_size.is_some_and(|s| s > 0);
        (info.total_size, ranged)
    };

    {
        let mut t = task.lock().await;
        t.total_size = total_size;
        t.status = TaskStatus::Downloading;
        if t.started_at.is_none() {
            t.started_at = Some(chrono::Utc::now());
        }
        if t.chunks.is_empty() {
            t.chunks = if ranged_mode {
                planner::plan(
                    total_size.unwrap_or(0),
                    connections,
                    config.min_chunk_size,
                )
            } else {
                Vec::new()
            };
        }
    }

    std::fs::create_dir_all(&save_directory)?;
    let temp_path = task.lock().await.temp_path();

    if ranged_mode {
        prepare_sparse_file(&temp_path, total_size.unwrap_or(0)).await?;
        match run_ranged(&task, &client, &config, &control, &on_progress, &temp_path).await? {
            Outcome::Completed => {}
            other => return Ok(other),
        }
    } else {
        match run_single_stream(&task, &client, &config, &control, &on_progress, &temp_path)
            .await?
        {
            Outcome::Completed => {}
            other => return Ok(other),
        }
    }

    finalize(&task, &temp_path).await?;
    Ok(Outcome::Completed)
}

async fn prepare_sparse_file(temp_path: &Path, total_size: u64) -> EngineResult<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(temp_path)
        .await?;
    if total_size > 0 {
        file.set_len(total_size).await?;
    }
    Ok(())
}

async fn run_ranged(
    task: &Arc<Mutex<Task>>,
    client: &Client,
    config: &WorkerConfig,
    control: &WorkerControl,
    on_progress: &ProgressCallback,
    temp_path: &Path,
) -> EngineResult<Outcome> {
    let url = task.lock().await.url.clone();
    let chunk_count = task.lock().await.chunks.len();
    let throttle = Arc::new(Mutex::new(ProgressThrottle {
        last_emit: Instant::now(),
        last_bytes: task.lock().await.downloaded_size,
    }));

    let mut joins = tokio::task::JoinSet::new();
    for idx in 0..chunk_count {
        let task = Arc::clone(task);
        let client = client.clone();
        let config = config.clone();
        let control = control.clone();
        let on_progress = Arc::clone(on_progress);
        let throttle = Arc::clone(&throttle);
        let url = url.clone();
        let temp_path = temp_path.to_path_buf();
        joins.spawn(async move {
            fetch_chunk(
                idx,
                task,
                client,
                config,
                control,
                on_progress,
                throttle,
                url,
                temp_path,
            )
            .await
        });
    }

    let mut server_ignored_range = false;
    let mut first_error: Option<EngineError> = None;
    while let Some(res) = joins.join_next().await {
        match res {
            Ok(Ok(ChunkOutcome::Done)) => {}
            Ok(Ok(ChunkOutcome::Paused)) => {
                joins.abort_all();
                return Ok(Outcome::Paused);
            }
            Ok(Ok(ChunkOutcome::Stopped)) => {
                joins.abort_all();
                return Ok(Outcome::Stopped);
            }
            Ok(Ok(ChunkOutcome::ServerIgnoredRange)) => {
                server_ignored_range = true;
                joins.abort_all();
                break;
            }
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                if !join_err.is_cancelled() {
                    first_error.get_or_insert(EngineError::Probe(join_err.to_string()));
                }
            }
        }
    }

    if server_ignored_range {
        warn!("server ignored Range header; falling back to single-stream");
        {
            let mut t = task.lock().await;
            t.chunks.clear();
            t.downloaded_size = 0;
        }
        return run_single_stream(task, client, config, control, on_progress, temp_path).await;
    }

    if let Some(err) = first_error {
        let mut t = task.lock().await;
        t.status = TaskStatus::Failed;
        t.error = Some(err.to_string());
        on_progress(&t);
        return Err(err);
    }

    Ok(Outcome::Completed)
}

enum ChunkOutcome {
    Done,
    Paused,
    Stopped,
    ServerIgnoredRange,
}

#[allow(clippy::too_many_arguments)]
async fn fetch_chunk(
    idx: usize,
    task: Arc<Mutex<Task>>,
    client: Client,
    config: WorkerConfig,
    control: WorkerControl,
    on_progress: ProgressCallback,
    throttle: Arc<Mutex<ProgressThrottle>>,
    url: String,
    temp_path: std::path::PathBuf,
) -> EngineResult<ChunkOutcome> {
    let mut attempt = 0u32;
    loop {
        let (start, end, downloaded) = {
            let t = task.lock().await;
            let c = &t.chunks[idx];
            (c.start, c.end, c.downloaded)
        };
        if downloaded as u64 >= end - start + 1 {
            return Ok(ChunkOutcome::Done);
        }

        let resume_from = start + downloaded;
        let response = match http::get_range(&client, &url, resume_from, end, config.timeout).await
        {
            Ok(r) => r,
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    return Err(e);
                }
                backoff(&config, attempt).await;
                continue;
            }
        };

        let status = response.status();
        if status.as_u16() == 200 && idx == 0 {
            return Ok(ChunkOutcome::ServerIgnoredRange);
        }
        if status.as_u16() != 206 {
            attempt += 1;
            if attempt > config.max_retries {
                return Err(EngineError::ServerContract {
                    status: status.as_u16(),
                    context: format!("ranged GET for chunk {idx}"),
                });
            }
            backoff(&config, attempt).await;
            continue;
        }

        let mut file = match OpenOptions::new().write(true).open(&temp_path).await {
            Ok(f) => f,
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = file.seek(std::io::SeekFrom::Start(resume_from)).await {
            return Err(e.into());
        }

        let mut stream = response.bytes_stream();
        let mut chunk_downloaded = downloaded;
        let mut transport_failed = false;
        while let Some(item) = stream.next().await {
            if control.is_stopped() {
                let mut t = task.lock().await;
                t.status = TaskStatus::Stopped;
                return Ok(ChunkOutcome::Stopped);
            }
            if control.is_paused() {
                let mut t = task.lock().await;
                t.status = TaskStatus::Paused;
                return Ok(ChunkOutcome::Paused);
            }

            let bytes = match item {
                Ok(b) => b,
                Err(_) => {
                    transport_failed = true;
                    break;
                }
            };
            if let Err(e) = file.write_all(&bytes).await {
                return Err(e.into());
            }
            chunk_downloaded += bytes.len() as u64;

            {
                let mut t = task.lock().await;
                t.chunks[idx].downloaded = chunk_downloaded;
                t.resync_downloaded();
            }
            maybe_emit_progress(&task, &throttle, &on_progress).await;
        }

        if transport_failed {
            attempt += 1;
            if attempt > config.max_retries {
                return Err(EngineError::ServerContract {
                    status: 0,
                    context: format!("chunk {idx} transport failure"),
                });
            }
            debug!(chunk = idx, attempt, "retrying chunk after transport error");
            backoff(&config, attempt).await;
            continue;
        }

        return Ok(ChunkOutcome::Done);
    }
}

async fn run_single_stream(
    task: &Arc<Mutex<Task>>,
    client: &Client,
    config: &WorkerConfig,
    control: &WorkerControl,
    on_progress: &ProgressCallback,
    temp_path: &Path,
) -> EngineResult<Outcome> {
    let url = task.lock().await.url.clone();
    let mut attempt = 0u32;
    let throttle = Arc::new(Mutex::new(ProgressThrottle {
        last_emit: Instant::now(),
        last_bytes: 0,
    }));

    loop {
        let response = match http::get_full(client, &url, config.timeout).await {
            Ok(r) => r,
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    let mut t = task.lock().await;
                    t.status = TaskStatus::Failed;
                    t.error = Some(e.to_string());
                    on_progress(&t);
                    return Err(e);
                }
                backoff(config, attempt).await;
                continue;
            }
        };

        if !response.status().is_success() {
            attempt += 1;
            if attempt > config.max_retries {
                return Err(EngineError::ServerContract {
                    status: response.status().as_u16(),
                    context: "single-stream GET".to_string(),
                });
            }
            backoff(config, attempt).await;
            continue;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(temp_path)
            .await?;

        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        let mut transport_failed = false;
        while let Some(item) = stream.next().await {
            if control.is_stopped() {
                let mut t = task.lock().await;
                t.status = TaskStatus::Stopped;
                return Ok(Outcome::Stopped);
            }
            if control.is_paused() {
                let mut t = task.lock().await;
                t.status = TaskStatus::Paused;
                return Ok(Outcome::Paused);
            }
            let bytes = match item {
                Ok(b) => b,
                Err(_) => {
                    transport_failed = true;
                    break;
                }
            };
            file.write_all(&bytes).await?;
            downloaded += bytes.len() as u64;
            {
                let mut t = task.lock().await;
                t.downloaded_size = downloaded;
            }
            maybe_emit_progress(task, &throttle, on_progress).await;
        }

        if transport_failed {
            attempt += 1;
            if attempt > config.max_retries {
                return Err(EngineError::ServerContract {
                    status: 0,
                    context: "single-stream transport failure".to_string(),
                });
            }
            backoff(config, attempt).await;
            continue;
        }

        return Ok(Outcome::Completed);
    }
}

async fn maybe_emit_progress(
    task: &Arc<Mutex<Task>>,
    throttle: &Arc<Mutex<ProgressThrottle>>,
    on_progress: &ProgressCallback,
) {
    let mut th = throttle.lock().await;
    if th.last_emit.elapsed() < Duration::from_secs(1) {
        return;
    }
    let mut t = task.lock().await;
    let now_bytes = t.downloaded_size;
    let elapsed = th.last_emit.elapsed().as_secs_f64().max(1.0);
    t.speed_bps = (now_bytes.saturating_sub(th.last_bytes)) as f64 / elapsed;
    th.last_bytes = now_bytes;
    th.last_emit = Instant::now();
    on_progress(&t);
}

async fn backoff(config: &WorkerConfig, attempt: u32) {
    let delay = if config.exponential_backoff {
        config.retry_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    } else {
        config.retry_delay
    };
    tokio::time::sleep(delay).await;
}

async fn finalize(task: &Arc<Mutex<Task>>, temp_path: &Path) -> EngineResult<()> {
    let mut t = task.lock().await;
    let metadata = tokio::fs::metadata(temp_path).await?;
    let actual_size = metadata.len();
    let expected_ok = match t.total_size {
        Some(total) if total > 0 => actual_size == total,
        _ => actual_size > 0,
    };
    if !expected_ok {
        t.status = TaskStatus::Failed;
        t.error = Some(format!(
            "size mismatch: expected {:?}, got {}",
            t.total_size, actual_size
        ));
        return Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "downloaded size did not match expected size",
        )));
    }

    let final_path = t.final_path();
    if tokio::fs::metadata(&final_path).await.is_ok() {
        tokio::fs::remove_file(&final_path).await?;
    }
    tokio::fs::rename(temp_path, &final_path).await?;

    t.status = TaskStatus::Completed;
    t.completed_at = Some(chrono::Utc::now());
    t.downloaded_size = actual_size;
    info!(path = %final_path.display(), "task completed");
    Ok(())
}
