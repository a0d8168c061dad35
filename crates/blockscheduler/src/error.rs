use crate::ScheduleId;
use thiserror::Error;

/// Schedule store failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("Schedule not found: {0}")]
    NotFound(ScheduleId),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Schedule store error: {0}")]
    Backend(String),
}

/// Durable task queue failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    ConnectionFailed(String),

    #[error("Failed to serialize payload: {0}")]
    SerializationFailed(String),

    #[error("Failed to publish task: {0}")]
    PublishFailed(String),

    #[error("Failed to poll tasks: {0}")]
    PollFailed(String),
}

/// Failure to hand one schedule (or the whole tick) to an execution path
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Worker pool is shut down")]
    PoolClosed,
}
