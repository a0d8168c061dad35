use crate::schedule::next_fire_after;
use crate::{DispatchError, ScheduleEntry, ScheduleStore, TaskQueue, TriggerPayload, WorkerPool};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where fired schedules go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DispatchStrategy {
    /// Publish to the durable queue under `task_name`
    #[serde(rename_all = "camelCase")]
    Queue { task_name: String },
    /// Run in this process on the worker pool
    Direct,
}

/// Result of one dispatch tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Due entries picked up
    pub attempted: usize,
    /// Handed to the queue or pool
    pub enqueued: usize,
    pub failed: usize,
}

enum Backend {
    Queue { queue: Arc<dyn TaskQueue>, task_name: String },
    Direct(Arc<WorkerPool>),
}

/// Finds due schedules and hands each to the queue or the worker pool
pub struct ScheduleDispatcher {
    store: Arc<dyn ScheduleStore>,
    backend: Backend,
}

impl ScheduleDispatcher {
    pub fn queued(store: Arc<dyn ScheduleStore>, queue: Arc<dyn TaskQueue>, task_name: impl Into<String>) -> Self {
        Self {
            store,
            backend: Backend::Queue {
                queue,
                task_name: task_name.into(),
            },
        }
    }

    pub fn direct(store: Arc<dyn ScheduleStore>, pool: Arc<WorkerPool>) -> Self {
        Self {
            store,
            backend: Backend::Direct(pool),
        }
    }

    pub fn strategy(&self) -> DispatchStrategy {
        match &self.backend {
            Backend::Queue { task_name, .. } => DispatchStrategy::Queue {
                task_name: task_name.clone(),
            },
            Backend::Direct(_) => DispatchStrategy::Direct,
        }
    }

    /// Dispatch every entry due at `now`, concurrently. One entry failing
    /// never affects the others; only the due-set query can fail the tick.
    pub async fn dispatch(&self, now: DateTime<Utc>) -> Result<DispatchReport, DispatchError> {
        let due = self.store.due(now).await?;
        let attempted = due.len();
        if attempted == 0 {
            tracing::debug!("No schedules due at {}", now);
            return Ok(DispatchReport::default());
        }

        let results = join_all(due.iter().map(|entry| self.dispatch_one(entry, now))).await;

        let mut failed = 0;
        for (entry, result) in due.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                tracing::error!(
                    schedule_id = %entry.schedule_id,
                    workflow_id = %entry.workflow_id,
                    "Failed to dispatch schedule: {}",
                    e
                );
            }
        }

        let report = DispatchReport {
            attempted,
            enqueued: attempted - failed,
            failed,
        };
        tracing::info!(
            attempted = report.attempted,
            enqueued = report.enqueued,
            failed = report.failed,
            "Dispatch tick finished"
        );
        Ok(report)
    }

    async fn dispatch_one(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> Result<(), DispatchError> {
        // A bad cron expression fails before anything is handed off
        let next_run_at = entry
            .cron_expression
            .as_deref()
            .map(|expression| next_fire_after(expression, now))
            .transpose()?;
        let payload = TriggerPayload::new(entry, now);

        match &self.backend {
            Backend::Queue { queue, task_name } => queue.enqueue(task_name, &payload).await?,
            Backend::Direct(pool) => pool.submit(payload).await?,
        }

        // The trigger is already handed off, so a bookkeeping failure still counts as enqueued
        if let Err(e) = self.store.mark_dispatched(entry.schedule_id, now, next_run_at).await {
            tracing::error!(
                schedule_id = %entry.schedule_id,
                "Dispatched schedule but could not advance it: {}",
                e
            );
        }
        Ok(())
    }
}
