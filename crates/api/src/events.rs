use engine::task::{Task, TaskId};
use tokio::sync::broadcast;

/// Typed fan-out of scheduler-level task lifecycle events. Delivery is
/// best-effort in order per task; a slow subscriber may miss intermediate
/// `TaskUpdated` events but will observe the latest one to arrive before any
/// terminal event.
#[derive(Debug, Clone)]
pub enum Event {
    TaskAdded(Task),
    TaskRemoved(TaskId),
    TaskUpdated(Task),
    TaskCompleted(TaskId),
    TaskFailed(TaskId, String),
    AllTasksCompleted,
}

const CHANNEL_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Best-effort: a publish with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
