//! The task scheduler (download manager): the single public façade owning
//! the task set, the global concurrency admission cap, and the observer bus.

pub mod config;
pub mod error;
pub mod events;

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use engine::task::{Task, TaskId, TaskStatus};
use engine::worker::{run_task, Outcome, WorkerControl};
use reqwest::Client;
use storage::TaskStore;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info, info_span, warn, Instrument};

pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use events::{Event, EventBus};

pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    tasks: DashMap<TaskId, Task>,
    controls: DashMap<TaskId, WorkerControl>,
    /// Insertion order, for deterministic Waiting-task promotion.
    order: AsyncMutex<Vec<TaskId>>,
    /// Serializes every scheduler operation (add/remove/start/pause/resume/
    /// stop/clear_completed) the way the component design calls for: at most
    /// one mutates the task set and makes an admission decision at a time.
    op_lock: AsyncMutex<()>,
    /// One permit per concurrently active task; admission is "try to
    /// acquire a permit", not a hand-rolled counter.
    admission: Arc<Semaphore>,
    config: SchedulerConfig,
    store: TaskStore,
    events: EventBus,
    client: Client,
}

impl Scheduler {
    /// Loads any persisted tasks from `store_path` and constructs a scheduler
    /// around the given config. Config is a plain value passed in here --
    /// never a global singleton.
    pub fn new(config: SchedulerConfig, store_path: PathBuf) -> Self {
        let store = TaskStore::new(store_path);
        let loaded = store.load();

        let tasks = DashMap::new();
        let mut order = Vec::with_capacity(loaded.len());
        for task in loaded {
            order.push(task.id);
            tasks.insert(task.id, task);
        }

        let admission = Arc::new(Semaphore::new(config.max_concurrent_downloads as usize));

        let inner = Arc::new(Inner {
            tasks,
            controls: DashMap::new(),
            order: AsyncMutex::new(order),
            op_lock: AsyncMutex::new(()),
            admission,
            config,
            store,
            events: EventBus::new(),
            client: Client::new(),
        });

        Scheduler { inner }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.inner.tasks.get(&id).map(|t| t.clone())
    }

    pub fn list(&self) -> Vec<Task> {
        self.inner.tasks.iter().map(|e| e.value().clone()).collect()
    }

    /// Adds a new task. Rejects synchronously if the destination file
    /// already exists or the input is malformed; otherwise starts
    /// immediately if a concurrency slot is free, else queues as Waiting.
    pub async fn add(
        &self,
        url: String,
        save_directory: String,
        filename: Option<String>,
        connections: Option<u32>,
    ) -> SchedulerResult<TaskId> {
        if url.trim().is_empty() {
            return Err(SchedulerError::InvalidInput("empty url".to_string()));
        }

        let filename = filename.unwrap_or_else(|| derive_filename(&url));
        let filename = sanitize_filename(&filename);

        let final_path = std::path::Path::new(&save_directory).join(&filename);
        if final_path.exists() {
            return Err(SchedulerError::AlreadyExists(
                final_path.display().to_string(),
            ));
        }

        let connections = connections.unwrap_or(self.inner.config.connections_per_file);
        let task = Task::new(url, save_directory, filename, connections);
        let id = task.id;

        let _guard = self.inner.op_lock.lock().await;
        self.inner.tasks.insert(id, task.clone());
        self.inner.order.lock().await.push(id);
        self.inner.events.publish(Event::TaskAdded(task));

        promote_waiting_locked(&self.inner).await;
        self.persist().await;

        Ok(id)
    }

    pub async fn remove(&self, id: TaskId) -> bool {
        let _guard = self.inner.op_lock.lock().await;
        if let Some(control) = self.inner.controls.get(&id) {
            control.request_stop();
        }
        let removed_task = self.inner.tasks.remove(&id).map(|(_, t)| t);
        if let Some(task) = removed_task {
            if let Err(e) = std::fs::remove_file(task.temp_path()) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(task_id = %id, error = %e, "failed to remove temp file for removed task");
                }
            }
            self.inner.order.lock().await.retain(|x| *x != id);
            self.inner.events.publish(Event::TaskRemoved(id));
            self.persist().await;
            true
        } else {
            false
        }
    }

    pub async fn start(&self, id: TaskId) -> SchedulerResult<()> {
        let _guard = self.inner.op_lock.lock().await;
        let status = self
            .inner
            .tasks
            .get(&id)
            .map(|t| t.status)
            .ok_or(SchedulerError::NotFound(id))?;

        // Matches the original's "already completed, nothing to do" guard:
        // restarting a Completed task would overwrite a correct final file
        // with a freshly (re)planned, empty temp file.
        if status == TaskStatus::Completed || status == TaskStatus::Downloading {
            return Ok(());
        }

        match Arc::clone(&self.inner.admission).try_acquire_owned() {
            Ok(permit) => spawn_worker(&self.inner, id, permit),
            Err(_) => {
                if let Some(mut t) = self.inner.tasks.get_mut(&id) {
                    t.status = TaskStatus::Waiting;
                }
            }
        }
        Ok(())
    }

    pub async fn pause(&self, id: TaskId) -> SchedulerResult<()> {
        let _guard = self.inner.op_lock.lock().await;
        let status = self
            .inner
            .tasks
            .get(&id)
            .map(|t| t.status)
            .ok_or(SchedulerError::NotFound(id))?;
        if status != TaskStatus::Downloading {
            return Ok(()); // idempotent: pausing a non-active task is a no-op
        }
        if let Some(control) = self.inner.controls.get(&id) {
            control.request_pause();
        }
        Ok(())
    }

    pub async fn resume(&self, id: TaskId) -> SchedulerResult<()> {
        self.start(id).await
    }

    pub async fn stop(&self, id: TaskId) -> SchedulerResult<()> {
        let _guard = self.inner.op_lock.lock().await;
        if !self.inner.tasks.contains_key(&id) {
            return Err(SchedulerError::NotFound(id));
        }
        if let Some(control) = self.inner.controls.get(&id) {
            control.request_stop();
        } else if let Some(mut t) = self.inner.tasks.get_mut(&id) {
            t.status = TaskStatus::Stopped;
        }
        Ok(())
    }

    pub async fn clear_completed(&self) {
        let _guard = self.inner.op_lock.lock().await;
        let completed: Vec<TaskId> = self
            .inner
            .tasks
            .iter()
            .filter(|e| e.value().status == TaskStatus::Completed)
            .map(|e| *e.key())
            .collect();
        for id in completed {
            self.inner.tasks.remove(&id);
            self.inner.order.lock().await.retain(|x| *x != id);
        }
    }

    pub async fn shutdown(&self) {
        for entry in self.inner.controls.iter() {
            entry.value().request_stop();
        }
        // Give in-flight workers a moment to reach a quiescent state before
        // the final flush; cooperative cancellation is not instantaneous.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.persist().await;
    }

    async fn persist(&self) {
        let snapshot = self.list();
        if let Err(e) = self.inner.store.save(&snapshot) {
            warn!(error = %e, "failed to persist task store");
        }
    }
}

fn all_terminal(tasks: &DashMap<TaskId, Task>) -> bool {
    tasks.iter().all(|e| {
        matches!(
            e.value().status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    })
}

/// Scans the insertion-ordered queue and starts Waiting tasks while a
/// concurrency permit remains available. Callers must already hold
/// `inner.op_lock`.
async fn promote_waiting_locked(inner: &Arc<Inner>) {
    let order = inner.order.lock().await.clone();
    for id in order {
        let is_waiting = inner
            .tasks
            .get(&id)
            .map(|t| t.status == TaskStatus::Waiting)
            .unwrap_or(false);
        if !is_waiting {
            continue;
        }
        match Arc::clone(&inner.admission).try_acquire_owned() {
            Ok(permit) => spawn_worker(inner, id, permit),
            Err(_) => break,
        }
    }
}

/// Acquires `op_lock` itself before promoting -- used by the worker
/// completion callback, which runs outside any public method's guard.
async fn promote_waiting(inner: &Arc<Inner>) {
    let _guard = inner.op_lock.lock().await;
    promote_waiting_locked(inner).await;
}

/// Spawns a worker for `id`, holding `permit` for the task's lifetime, and
/// wires its progress/terminal callbacks back into the scheduler's task map,
/// event bus, and persistent store.
fn spawn_worker(inner: &Arc<Inner>, id: TaskId, permit: OwnedSemaphorePermit) {
    let Some(mut task) = inner.tasks.get(&id).map(|t| t.clone()) else {
        drop(permit);
        return;
    };
    task.status = TaskStatus::Downloading;
    inner.tasks.insert(id, task.clone());

    let control = WorkerControl::new();
    inner.controls.insert(id, control.clone());

    let worker_config = inner.config.worker_config();
    let client = inner.client.clone();
    let task_arc = Arc::new(AsyncMutex::new(task));

    let progress_inner = Arc::clone(inner);
    let on_progress: engine::worker::ProgressCallback = Arc::new(move |t: &Task| {
        progress_inner.tasks.insert(id, t.clone());
        progress_inner.events.publish(Event::TaskUpdated(t.clone()));
    });

    let inner = Arc::clone(inner);
    tokio::spawn(
        async move {
            let result = run_task(
                Arc::clone(&task_arc),
                client,
                worker_config,
                control,
                on_progress,
            )
            .await;

            let final_task = task_arc.lock().await.clone();
            inner.tasks.insert(id, final_task.clone());
            inner.controls.remove(&id);
            // Release the admission permit before promoting the next Waiting
            // task, or the slot this task just freed won't be visible yet.
            drop(permit);

            match result {
                Ok(Outcome::Completed) => {
                    info!("task completed");
                    inner.events.publish(Event::TaskCompleted(id));
                    if all_terminal(&inner.tasks) {
                        inner.events.publish(Event::AllTasksCompleted);
                    }
                }
                Ok(Outcome::Paused) | Ok(Outcome::Stopped) => {
                    inner.events.publish(Event::TaskUpdated(final_task));
                }
                Err(e) => {
                    warn!(error = %e, "task failed");
                    inner.events.publish(Event::TaskFailed(id, e.to_string()));
                }
            }

            let snapshot: Vec<Task> = inner.tasks.iter().map(|e| e.value().clone()).collect();
            if let Err(e) = inner.store.save(&snapshot) {
                warn!(error = %e, "failed to persist task store after completion");
            }

            promote_waiting(&inner).await;
        }
        .instrument(info_span!("scheduled_task", task_id = %id)),
    );
}

/// Percent-decoded last path segment of `url`, ignoring any query string --
/// `.../file.zip?token=abc` derives `file.zip`, not `file.zip?token=abc`.
fn derive_filename(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return "download".to_string();
    };
    let last_segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    if last_segment.is_empty() {
        return "download".to_string();
    }
    percent_encoding::percent_decode_str(last_segment)
        .decode_utf8_lossy()
        .into_owned()
}

fn sanitize_filename(name: &str) -> String {
    let illegal = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let sanitized: String = name
        .chars()
        .map(|c| if illegal.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = sanitized.trim_matches(|c: char| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_filename_falls_back_when_path_empty() {
        assert_eq!(derive_filename("https://example.com/"), "download");
        assert_eq!(derive_filename("https://example.com/a/b.zip"), "b.zip");
    }

    #[test]
    fn derive_filename_ignores_query_string_and_decodes_percent_escapes() {
        assert_eq!(
            derive_filename("https://example.com/file.zip?token=abc"),
            "file.zip"
        );
        assert_eq!(
            derive_filename("https://example.com/my%20file.zip"),
            "my file.zip"
        );
    }

    #[test]
    fn sanitize_filename_strips_illegal_characters() {
        assert_eq!(sanitize_filename("a/b:c?.txt"), "a_b_c_.txt");
        assert_eq!(sanitize_filename("   "), "download");
    }
}
