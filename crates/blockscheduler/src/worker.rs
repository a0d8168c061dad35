use crate::{DispatchError, ScheduleRunner, TriggerPayload};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

/// Direct-execution pool: at most `max_concurrent` runs at once, every
/// task tracked in a `JoinSet` so none finish unobserved
pub struct WorkerPool {
    runner: Arc<ScheduleRunner>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(runner: Arc<ScheduleRunner>, max_concurrent: usize) -> Self {
        Self {
            runner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            counters: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a run and return without waiting for it
    pub async fn submit(&self, payload: TriggerPayload) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::PoolClosed);
        }

        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                tracing::error!("Scheduled run task panicked: {}", e);
            }
        }

        let runner = self.runner.clone();
        let permits = self.permits.clone();
        let counters = self.counters.clone();
        counters.submitted.fetch_add(1, Ordering::SeqCst);

        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match runner.run(payload).await {
                Ok(outcome) if outcome.succeeded() => {
                    counters.succeeded.fetch_add(1, Ordering::SeqCst);
                }
                Ok(_) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    tracing::error!("Scheduled run failed: {}", e);
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        Ok(())
    }

    /// Wait for every submitted run to finish
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!("Scheduled run task panicked: {}", e);
            }
        }
    }

    /// Refuse new work, then wait for what is in flight
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drain().await;
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            succeeded: self.counters.succeeded.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }
}
