use crate::{DispatchError, ScheduleEntry, ScheduleError, ScheduleId, ScheduleStore, TriggerPayload};
use async_trait::async_trait;
use blockcore::{ExecutionId, FlowError, RunStatus, TriggerKind, Value, WorkflowError};
use blockruntime::FlowRuntime;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub execution_id: ExecutionId,
    pub status: RunStatus,
}

impl LaunchOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Starts the workflow a schedule points at; the dispatcher sees only this
#[async_trait]
pub trait WorkflowLauncher: Send + Sync {
    async fn launch(&self, payload: &TriggerPayload) -> Result<LaunchOutcome, DispatchError>;
}

/// Run inputs a scheduled trigger block receives
pub fn schedule_inputs(payload: &TriggerPayload) -> HashMap<String, Value> {
    let mut inputs = HashMap::from([
        ("scheduleId".to_string(), Value::from(payload.schedule_id.to_string())),
        ("now".to_string(), Value::from(payload.now.to_rfc3339())),
    ]);
    if let Some(last) = payload.last_ran_at {
        inputs.insert("lastRanAt".to_string(), Value::from(last.to_rfc3339()));
    }
    inputs
}

#[async_trait]
impl WorkflowLauncher for FlowRuntime {
    /// Runs the deployed version, or the registered draft when nothing is deployed
    async fn launch(&self, payload: &TriggerPayload) -> Result<LaunchOutcome, DispatchError> {
        let inputs = schedule_inputs(payload);
        let result = match self
            .execute_deployed(payload.workflow_id, inputs.clone(), TriggerKind::Schedule)
            .await
        {
            Err(FlowError::Workflow(WorkflowError::NotDeployed(_))) => {
                self.execute_workflow(payload.workflow_id, inputs, TriggerKind::Schedule)
                    .await
            }
            other => other,
        }
        .map_err(|e| DispatchError::Launch(e.to_string()))?;

        Ok(LaunchOutcome {
            execution_id: result.execution_id,
            status: result.status,
        })
    }
}

/// Consumer-side logic shared by the worker pool and queue workers:
/// launch, then record how it went on the schedule row
pub struct ScheduleRunner {
    launcher: Arc<dyn WorkflowLauncher>,
    store: Arc<dyn ScheduleStore>,
}

impl ScheduleRunner {
    pub fn new(launcher: Arc<dyn WorkflowLauncher>, store: Arc<dyn ScheduleStore>) -> Self {
        Self { launcher, store }
    }

    pub async fn run(&self, payload: TriggerPayload) -> Result<LaunchOutcome, DispatchError> {
        let span = tracing::info_span!(
            "schedule",
            schedule_id = %payload.schedule_id,
            workflow_id = %payload.workflow_id
        );

        self.launch_and_record(payload).instrument(span).await
    }

    async fn launch_and_record(&self, payload: TriggerPayload) -> Result<LaunchOutcome, DispatchError> {
        let outcome = self.launcher.launch(&payload).await;
        let success = matches!(&outcome, Ok(o) if o.succeeded());
        match &outcome {
            Ok(o) => tracing::info!("Scheduled run {} finished {:?}", o.execution_id, o.status),
            Err(e) => tracing::error!("Scheduled run failed to start: {}", e),
        }
        self.record_outcome(payload.schedule_id, success).await?;
        outcome
    }

    pub async fn record_outcome(&self, id: ScheduleId, success: bool) -> Result<ScheduleEntry, ScheduleError> {
        let entry = self.store.record_outcome(id, success).await?;
        if !success && entry.is_disabled() {
            tracing::warn!(
                "Disabled schedule {} after {} consecutive failures",
                id,
                entry.failed_count
            );
        }
        Ok(entry)
    }
}
