use async_trait::async_trait;
use blockcore::{BlockConfig, BlockDefinition, RunStatus, TriggerConfig, TriggerKind, Workflow, WorkflowId};
use blockruntime::{FlowRuntime, HandlerRegistry, RuntimeConfig};
use blockscheduler::*;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use uuid::Uuid;

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
}

/// Records payloads and refuses the workflows listed in `reject`
#[derive(Default)]
struct RecordingQueue {
    sent: Mutex<Vec<(String, TriggerPayload)>>,
    reject: HashSet<WorkflowId>,
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task_name: &str, payload: &TriggerPayload) -> Result<(), QueueError> {
        if self.reject.contains(&payload.workflow_id) {
            return Err(QueueError::PublishFailed("broker unavailable".to_string()));
        }
        self.sent.lock().unwrap().push((task_name.to_string(), payload.clone()));
        Ok(())
    }
}

/// Launcher with a fixed outcome that counts its calls
struct FixedLauncher {
    status: RunStatus,
    calls: AtomicUsize,
}

impl FixedLauncher {
    fn new(status: RunStatus) -> Arc<Self> {
        Arc::new(Self {
            status,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl WorkflowLauncher for FixedLauncher {
    async fn launch(&self, _payload: &TriggerPayload) -> Result<LaunchOutcome, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchOutcome {
            execution_id: Uuid::new_v4(),
            status: self.status,
        })
    }
}

fn direct(store: Arc<InMemoryScheduleStore>, launcher: Arc<dyn WorkflowLauncher>) -> (ScheduleDispatcher, Arc<WorkerPool>) {
    let runner = Arc::new(ScheduleRunner::new(launcher, store.clone()));
    let pool = Arc::new(WorkerPool::new(runner, 4));
    (ScheduleDispatcher::direct(store, pool.clone()), pool)
}

#[tokio::test]
async fn only_active_entries_at_or_before_now_are_dispatched() {
    let now = noon();
    let due = ScheduleEntry::once(Uuid::new_v4(), now);
    let later = ScheduleEntry::once(Uuid::new_v4(), now + Duration::milliseconds(1));
    let mut disabled = ScheduleEntry::once(Uuid::new_v4(), now - Duration::minutes(5));
    disabled.status = ScheduleStatus::Disabled;
    let store = Arc::new(InMemoryScheduleStore::with_entries([due.clone(), later.clone(), disabled]));

    let launcher = FixedLauncher::new(RunStatus::Succeeded);
    let (dispatcher, pool) = direct(store.clone(), launcher.clone());

    let report = dispatcher.dispatch(now).await.unwrap();
    pool.drain().await;

    assert_eq!(report, DispatchReport { attempted: 1, enqueued: 1, failed: 0 });
    assert_eq!(launcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().succeeded, 1);

    // One-shot entries are disabled once dispatched
    let due = store.get(due.schedule_id).await.unwrap().unwrap();
    assert!(due.is_disabled());
    assert_eq!(due.last_ran_at, Some(now));
    assert_eq!(store.get(later.schedule_id).await.unwrap().unwrap(), later);
}

#[tokio::test]
async fn one_bad_entry_does_not_sink_the_batch() {
    let now = noon();
    let refused = Uuid::new_v4();
    let ok_once = ScheduleEntry::once(Uuid::new_v4(), now);
    let ok_cron = ScheduleEntry::cron(Uuid::new_v4(), "*/5 * * * *", now - Duration::minutes(5)).unwrap();
    let rejected = ScheduleEntry::once(refused, now);
    let mut broken = ScheduleEntry::once(Uuid::new_v4(), now);
    broken.cron_expression = Some("whenever".to_string());

    let store = Arc::new(InMemoryScheduleStore::with_entries([
        ok_once.clone(),
        ok_cron.clone(),
        rejected.clone(),
        broken.clone(),
    ]));
    let queue = Arc::new(RecordingQueue {
        reject: HashSet::from([refused]),
        ..Default::default()
    });
    let dispatcher = ScheduleDispatcher::queued(store.clone(), queue.clone(), DEFAULT_TASK_NAME);

    let report = dispatcher.dispatch(now).await.unwrap();

    assert_eq!(report, DispatchReport { attempted: 4, enqueued: 2, failed: 2 });
    let sent = queue.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(task, payload)| task == DEFAULT_TASK_NAME && payload.now == now));

    // Failed entries stay untouched and come up again next tick
    assert_eq!(store.get(rejected.schedule_id).await.unwrap().unwrap(), rejected);
    assert_eq!(store.get(broken.schedule_id).await.unwrap().unwrap(), broken);

    let advanced = store.get(ok_cron.schedule_id).await.unwrap().unwrap();
    assert_eq!(advanced.next_run_at, now + Duration::minutes(5));
    assert_eq!(advanced.last_ran_at, Some(now));
    assert!(!advanced.is_disabled());
}

#[tokio::test]
async fn failed_runs_count_towards_disabling() {
    let now = noon();
    let mut entry = ScheduleEntry::cron(Uuid::new_v4(), "* * * * *", now - Duration::minutes(1)).unwrap();
    entry.failed_count = MAX_CONSECUTIVE_FAILURES - 1;
    let id = entry.schedule_id;
    let store = Arc::new(InMemoryScheduleStore::with_entries([entry]));

    let (dispatcher, pool) = direct(store.clone(), FixedLauncher::new(RunStatus::Failed));
    let report = dispatcher.dispatch(now).await.unwrap();
    pool.shutdown().await;

    assert_eq!(report.enqueued, 1);
    assert_eq!(pool.stats().failed, 1);
    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.failed_count, MAX_CONSECUTIVE_FAILURES);
    assert!(entry.is_disabled());
    assert!(pool.submit(TriggerPayload::new(&entry, now)).await.is_err());
}

#[tokio::test]
async fn direct_dispatch_runs_the_workflow_with_schedule_trigger() {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(Start));
    let runtime = FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default());

    let mut workflow = Workflow::new("nightly");
    workflow.add_block(BlockDefinition::new(
        "start",
        BlockConfig::trigger(TriggerConfig {
            schedule: Some("0 3 * * *".to_string()),
            ..Default::default()
        }),
    ));
    let workflow_id = workflow.id;
    let now = Utc::now();
    let entries = entries_for_workflow(&workflow, now - Duration::days(1)).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].block_id.as_deref(), Some("start"));
    runtime.register_workflow(workflow).await.unwrap();

    let store = Arc::new(InMemoryScheduleStore::with_entries(entries));
    let (dispatcher, pool) = direct(store, Arc::new(runtime.clone()));

    let report = dispatcher.dispatch(now).await.unwrap();
    pool.drain().await;

    assert_eq!(report.attempted, 1);
    assert_eq!(pool.stats().succeeded, 1);
    let logs = runtime.executions_for(workflow_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].trigger, TriggerKind::Schedule);
}

/// In-process queue: what is enqueued comes back out in order, then the source closes
#[derive(Default)]
struct LocalQueue {
    pending: Mutex<VecDeque<TriggerPayload>>,
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn enqueue(&self, _task_name: &str, payload: &TriggerPayload) -> Result<(), QueueError> {
        self.pending.lock().unwrap().push_back(payload.clone());
        Ok(())
    }
}

#[async_trait]
impl TaskSource for LocalQueue {
    async fn next_trigger(&self) -> Result<Option<TriggerPayload>, QueueError> {
        Ok(self.pending.lock().unwrap().pop_front())
    }
}

#[tokio::test]
async fn queue_worker_runs_every_enqueued_trigger() {
    let now = noon();
    let entries: Vec<_> = (0..3).map(|_| ScheduleEntry::once(Uuid::new_v4(), now)).collect();
    let store = Arc::new(InMemoryScheduleStore::with_entries(entries.clone()));
    let queue = Arc::new(LocalQueue::default());
    let dispatcher = ScheduleDispatcher::queued(store.clone(), queue.clone(), DEFAULT_TASK_NAME);

    let report = dispatcher.dispatch(now).await.unwrap();
    assert_eq!(report.enqueued, 3);

    let launcher = FixedLauncher::new(RunStatus::Failed);
    let runner = Arc::new(ScheduleRunner::new(launcher.clone(), store.clone()));
    let worker = QueueWorker::new(queue, runner, StdDuration::from_millis(10));

    assert_eq!(worker.run().await, 3);
    assert_eq!(launcher.calls.load(Ordering::SeqCst), 3);
    for entry in entries {
        assert_eq!(store.get(entry.schedule_id).await.unwrap().unwrap().failed_count, 1);
    }
}

/// Store whose bookkeeping after a hand-off always fails
struct StuckStore(InMemoryScheduleStore);

#[async_trait]
impl ScheduleStore for StuckStore {
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        self.0.due(now).await
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduleEntry>, ScheduleError> {
        self.0.get(id).await
    }

    async fn list(&self) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        self.0.list().await
    }

    async fn upsert(&self, entry: ScheduleEntry) -> Result<(), ScheduleError> {
        self.0.upsert(entry).await
    }

    async fn mark_dispatched(
        &self,
        _id: ScheduleId,
        _ran_at: DateTime<Utc>,
        _next_run_at: Option<DateTime<Utc>>,
    ) -> Result<ScheduleEntry, ScheduleError> {
        Err(ScheduleError::Backend("write timed out".to_string()))
    }

    async fn record_outcome(&self, id: ScheduleId, success: bool) -> Result<ScheduleEntry, ScheduleError> {
        self.0.record_outcome(id, success).await
    }
}

#[tokio::test]
async fn handed_off_trigger_counts_as_enqueued_when_bookkeeping_fails() {
    let now = noon();
    let entry = ScheduleEntry::once(Uuid::new_v4(), now);
    let store = Arc::new(StuckStore(InMemoryScheduleStore::with_entries([entry])));
    let queue = Arc::new(RecordingQueue::default());
    let dispatcher = ScheduleDispatcher::queued(store, queue.clone(), DEFAULT_TASK_NAME);

    let report = dispatcher.dispatch(now).await.unwrap();

    assert_eq!(report, DispatchReport { attempted: 1, enqueued: 1, failed: 0 });
    assert_eq!(queue.sent.lock().unwrap().len(), 1);
}

/// Minimal trigger so the runtime test does not depend on the handler crate
struct Start;

#[async_trait]
impl blockcore::BlockHandler for Start {
    fn block_type(&self) -> blockcore::BlockType {
        blockcore::BlockType::Trigger
    }

    async fn execute(&self, ctx: blockcore::BlockContext) -> Result<blockcore::BlockOutput, blockcore::BlockError> {
        Ok(blockcore::BlockOutput::new().with_outputs(ctx.inputs))
    }
}
