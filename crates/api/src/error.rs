use engine::task::TaskId;
use thiserror::Error;

/// Synchronous validation errors from `Scheduler::add`; every other
/// operation reports failure asynchronously through the observer bus.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("a file already exists at the destination: {0}")]
    AlreadyExists(String),

    #[error("no such task: {0}")]
    NotFound(TaskId),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
