use crate::stores::{InMemoryDeploymentStore, InMemoryExecutionLogStore, InMemorySnapshotStore};
use crate::{ExecutionResult, HandlerRegistry, WorkflowExecutor};
use async_trait::async_trait;
use blockcore::{
    BlockError, ChildRun, ChildWorkflowRunner, DeploymentStore, DeploymentVersion, EventBus,
    ExecutionEvent, ExecutionId, ExecutionLog, ExecutionLogStore, ExecutionLookup, FlowError,
    RunContext, SnapshotStore, StoreError, TriggerKind, Value, Workflow, WorkflowError, WorkflowId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Deepest allowed chain of nested `workflow` blocks
pub const MAX_WORKFLOW_DEPTH: usize = 10;

/// Main runtime for executing workflows
///
/// Cheap to clone; every clone shares the same registry, stores and
/// workflow table.
#[derive(Clone)]
pub struct FlowRuntime {
    registry: Arc<HandlerRegistry>,
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Workflow>>>,
    snapshots: Arc<dyn SnapshotStore>,
    logs: Arc<dyn ExecutionLogStore>,
    deployments: Arc<dyn DeploymentStore>,
    active: Arc<RwLock<HashMap<ExecutionId, CancellationToken>>>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    /// Create a new runtime with default settings and no handlers
    pub fn new() -> Self {
        Self::with_registry(Arc::new(HandlerRegistry::new()), RuntimeConfig::default())
    }

    /// Create a new runtime with a pre-configured registry and in-memory stores
    pub fn with_registry(registry: Arc<HandlerRegistry>, config: RuntimeConfig) -> Self {
        Self::with_stores(
            registry,
            config,
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(InMemoryExecutionLogStore::new()),
            Arc::new(InMemoryDeploymentStore::new()),
        )
    }

    pub fn with_stores(
        registry: Arc<HandlerRegistry>,
        config: RuntimeConfig,
        snapshots: Arc<dyn SnapshotStore>,
        logs: Arc<dyn ExecutionLogStore>,
        deployments: Arc<dyn DeploymentStore>,
    ) -> Self {
        let executor = Arc::new(WorkflowExecutor::new(config.max_parallel_blocks, snapshots.clone()));
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            registry,
            executor,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            snapshots,
            logs,
            deployments,
            active: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a workflow after checking its structure
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<(), FlowError> {
        crate::WorkflowIndex::build(&workflow)?;
        tracing::info!("Registered workflow: {} ({})", workflow.name, workflow.id);
        self.workflows.write().await.insert(workflow.id, workflow);
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> Option<Workflow> {
        self.workflows.read().await.get(&workflow_id).cloned()
    }

    pub async fn list_workflows(&self) -> Vec<Workflow> {
        self.workflows.read().await.values().cloned().collect()
    }

    pub async fn remove_workflow(&self, workflow_id: WorkflowId) -> Option<Workflow> {
        self.workflows.write().await.remove(&workflow_id)
    }

    /// Execute a workflow by ID (draft version)
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        inputs: HashMap<String, Value>,
        trigger: TriggerKind,
    ) -> Result<ExecutionResult, FlowError> {
        let workflow = self
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        self.execute_with(&workflow, inputs, trigger).await
    }

    /// Execute a workflow directly (without registration)
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionResult, FlowError> {
        self.execute_with(workflow, inputs, TriggerKind::Manual).await
    }

    pub async fn execute_with(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
        trigger: TriggerKind,
    ) -> Result<ExecutionResult, FlowError> {
        let ctx = RunContext::new(workflow.id, trigger).with_children(Arc::new(self.clone()));
        self.run(ctx, workflow, inputs).await
    }

    /// Execute the active deployed version of a workflow
    pub async fn execute_deployed(
        &self,
        workflow_id: WorkflowId,
        inputs: HashMap<String, Value>,
        trigger: TriggerKind,
    ) -> Result<ExecutionResult, FlowError> {
        let workflow = self.deployed_workflow(workflow_id).await?;
        self.execute_with(&workflow, inputs, trigger).await
    }

    async fn run(
        &self,
        ctx: RunContext,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionResult, FlowError> {
        let execution_id = ctx.execution_id;
        self.active
            .write()
            .await
            .insert(execution_id, ctx.cancellation.clone());

        let result = self
            .executor
            .execute(workflow, self.registry.clone(), &self.event_bus, ctx, inputs)
            .await;
        self.active.write().await.remove(&execution_id);
        let result = result?;

        self.logs
            .append(ExecutionLog {
                execution_id,
                workflow_id: result.workflow_id,
                snapshot_id: result.snapshot_id,
                trigger: result.trigger,
                status: result.status,
                started_at: result.started_at,
                ended_at: result.ended_at,
                total_duration_ms: result.duration_ms,
                cost: result.cost,
            })
            .await?;

        Ok(result)
    }

    /// Cancel a running execution. Returns false when it is not running.
    pub async fn cancel(&self, execution_id: ExecutionId) -> bool {
        match self.active.read().await.get(&execution_id) {
            Some(token) => {
                tracing::info!("Cancelling execution {}", execution_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn running_executions(&self) -> Vec<ExecutionId> {
        self.active.read().await.keys().copied().collect()
    }

    /// Publish the registered draft as the active deployed version
    pub async fn deploy(&self, workflow_id: WorkflowId) -> Result<DeploymentVersion, FlowError> {
        let workflow = self
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        let version = DeploymentVersion::new(workflow_id, serde_json::to_value(&workflow)?);
        self.deployments.activate(version.clone()).await?;
        tracing::info!("Deployed workflow {} as version {}", workflow_id, version.id);
        Ok(version)
    }

    /// State of the active deployed version, if the workflow has one
    pub async fn deployed_state(&self, workflow_id: WorkflowId) -> Result<Option<serde_json::Value>, FlowError> {
        Ok(self.deployments.deployed_state(workflow_id).await?)
    }

    async fn deployed_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, FlowError> {
        let state = self
            .deployed_state(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotDeployed(workflow_id.to_string()))?;
        Ok(serde_json::from_value(state)?)
    }

    /// What happened in a finished execution
    pub async fn lookup_execution(&self, execution_id: ExecutionId) -> Result<Option<ExecutionLookup>, FlowError> {
        let Some(log) = self.logs.find(execution_id).await? else {
            return Ok(None);
        };
        let snapshot = self
            .snapshots
            .get(log.snapshot_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("snapshot {}", log.snapshot_id)))?;
        Ok(Some(ExecutionLookup::new(&log, &snapshot)))
    }

    pub async fn executions_for(&self, workflow_id: WorkflowId) -> Result<Vec<ExecutionLog>, FlowError> {
        Ok(self.logs.list_for_workflow(workflow_id).await?)
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChildWorkflowRunner for FlowRuntime {
    async fn run_child(
        &self,
        parent: &RunContext,
        workflow_id: WorkflowId,
        inputs: HashMap<String, Value>,
    ) -> Result<ChildRun, BlockError> {
        if parent.depth >= MAX_WORKFLOW_DEPTH {
            return Err(BlockError::ExecutionFailed(format!(
                "workflow nesting deeper than {} levels",
                MAX_WORKFLOW_DEPTH
            )));
        }

        let workflow = match self.get_workflow(workflow_id).await {
            Some(workflow) => workflow,
            None => self
                .deployed_workflow(workflow_id)
                .await
                .map_err(|e| BlockError::Configuration(e.to_string()))?,
        };

        let result = self
            .run(parent.child(workflow_id), &workflow, inputs)
            .await
            .map_err(|e| BlockError::ExecutionFailed(e.to_string()))?;

        Ok(ChildRun {
            execution_id: result.execution_id,
            status: result.status,
            outputs: result.final_output,
        })
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Independent top-level blocks allowed in flight at once
    pub max_parallel_blocks: usize,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_blocks: 10,
            event_buffer_size: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `BLOCKFLOW_MAX_PARALLEL` and `BLOCKFLOW_EVENT_BUFFER`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_parallel_blocks: env_or("BLOCKFLOW_MAX_PARALLEL", defaults.max_parallel_blocks),
            event_buffer_size: env_or("BLOCKFLOW_EVENT_BUFFER", defaults.event_buffer_size),
        }
    }
}

fn env_or(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring {}={:?}: not a number", key, raw);
            default
        }),
        Err(_) => default,
    }
}
