//! Scheduled dispatch
//!
//! Finds due schedule entries and hands them to a durable queue (Iggy) or
//! an in-process worker pool. Launching is behind `WorkflowLauncher`, so
//! the dispatcher never touches the engine directly.

mod config;
mod dispatcher;
mod error;
mod iggy_queue;
mod queue;
mod runner;
mod schedule;
mod store;
mod worker;

pub use config::{SchedulerConfig, DEFAULT_TASK_NAME};
pub use dispatcher::{DispatchReport, DispatchStrategy, ScheduleDispatcher};
pub use error::{DispatchError, QueueError, ScheduleError};
pub use iggy_queue::{IggyQueueConfig, IggyTaskConsumer, IggyTaskQueue};
pub use queue::{QueueWorker, TaskQueue, TaskSource};
pub use runner::{schedule_inputs, LaunchOutcome, ScheduleRunner, WorkflowLauncher};
pub use schedule::{
    entries_for_workflow, next_fire_after, parse_cron, ScheduleEntry, ScheduleId, ScheduleStatus,
    TriggerPayload, MAX_CONSECUTIVE_FAILURES,
};
pub use store::{InMemoryScheduleStore, ScheduleStore};
pub use worker::{PoolStats, WorkerPool};
