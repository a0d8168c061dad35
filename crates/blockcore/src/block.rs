use crate::events::{EventEmitter, ExecutionId};
use crate::identity;
use crate::snapshot::RunStatus;
use crate::workflow::{BlockConfig, BlockType, ContainerKind, WorkflowId};
use crate::{BlockError, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Core trait that every block type implements
#[async_trait]
pub trait BlockHandler: Send + Sync {
    /// The block type this handler executes
    fn block_type(&self) -> BlockType;

    /// Execute one (possibly virtual) block identity
    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError>;

    /// Optional: describe the handler for listings
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::default()
    }

    /// Optional: reject a configuration when the workflow is loaded
    fn validate_config(&self, _config: &BlockConfig) -> Result<(), BlockError> {
        Ok(())
    }
}

/// Runs a nested workflow on behalf of a `workflow` block
#[async_trait]
pub trait ChildWorkflowRunner: Send + Sync {
    async fn run_child(
        &self,
        parent: &RunContext,
        workflow_id: WorkflowId,
        inputs: HashMap<String, Value>,
    ) -> Result<ChildRun, BlockError>;
}

/// Outcome of a nested workflow run
#[derive(Debug, Clone)]
pub struct ChildRun {
    pub execution_id: ExecutionId,
    pub status: RunStatus,
    pub outputs: HashMap<String, Value>,
}

/// How a run was started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    #[default]
    Manual,
    Api,
    Schedule,
    Webhook,
    /// Child run started by a `workflow` block
    Workflow,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Api => "api",
            TriggerKind::Schedule => "schedule",
            TriggerKind::Webhook => "webhook",
            TriggerKind::Workflow => "workflow",
        };
        f.write_str(s)
    }
}

/// Run-scoped data shared by every block of one execution
#[derive(Clone)]
pub struct RunContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub trigger: TriggerKind,
    /// Nesting depth; 0 for a top-level run
    pub depth: usize,
    pub cancellation: CancellationToken,
    /// Tracing span tagged with the execution id
    pub span: tracing::Span,
    pub children: Option<Arc<dyn ChildWorkflowRunner>>,
}

impl RunContext {
    pub fn new(workflow_id: WorkflowId, trigger: TriggerKind) -> Self {
        let execution_id = ExecutionId::new_v4();
        Self {
            execution_id,
            workflow_id,
            trigger,
            depth: 0,
            cancellation: CancellationToken::new(),
            span: tracing::info_span!("run", %execution_id, %workflow_id, %trigger),
            children: None,
        }
    }

    pub fn with_children(mut self, children: Arc<dyn ChildWorkflowRunner>) -> Self {
        self.children = Some(children);
        self
    }

    /// Context for a nested run one level deeper, cancelled with its parent.
    pub fn child(&self, workflow_id: WorkflowId) -> Self {
        let execution_id = ExecutionId::new_v4();
        Self {
            execution_id,
            workflow_id,
            trigger: TriggerKind::Workflow,
            depth: self.depth + 1,
            cancellation: self.cancellation.child_token(),
            span: tracing::info_span!(parent: &self.span, "run", %execution_id, %workflow_id, depth = self.depth + 1),
            children: self.children.clone(),
        }
    }
}

/// Current iteration of the innermost enclosing loop or parallel
#[derive(Debug, Clone, PartialEq)]
pub struct IterationContext {
    pub kind: ContainerKind,
    pub container_id: String,
    pub index: usize,
    pub item: Value,
    pub total: usize,
}

/// Execution context passed to each handler
#[derive(Clone)]
pub struct BlockContext {
    /// Identity of this execution; virtual inside loops and parallels
    pub block_id: String,

    /// Configuration with `<ref>` expressions already resolved
    pub config: BlockConfig,

    /// Outputs of the upstream blocks, keyed by their block id
    pub inputs: HashMap<String, Value>,

    pub iteration: Option<IterationContext>,

    pub run: RunContext,

    /// Event emitter for real-time updates
    pub events: EventEmitter,
}

impl BlockContext {
    /// Id of the block definition behind this identity
    pub fn original_id(&self) -> &str {
        identity::extract_original(&self.block_id)
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, BlockError> {
        self.inputs
            .get(name)
            .ok_or_else(|| BlockError::MissingInput(name.to_string()))
    }

    /// Look up `source.path` inside the inputs
    pub fn input_path(&self, path: &str) -> Option<&Value> {
        let (head, rest) = path.split_once('.').unwrap_or((path, ""));
        self.inputs.get(head).and_then(|v| v.get_path(rest))
    }

    /// All inputs as one object value
    pub fn inputs_value(&self) -> Value {
        Value::Object(self.inputs.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.cancellation.is_cancelled()
    }

    /// Span for handler-level logging, nested under the run span
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(parent: &self.run.span, "block", block_id = %self.block_id)
    }
}

/// Output from block execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockOutput {
    /// Output field values
    pub outputs: HashMap<String, Value>,

    /// Branch or route picked by condition and router blocks
    pub route: Option<String>,

    /// Execution metadata
    pub metadata: BlockMetadata,
}

impl BlockOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    pub fn with_outputs(mut self, outputs: HashMap<String, Value>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.metadata.cost = Some(cost);
        self
    }
}

/// Metadata about block execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Spend attributed to this block (model tokens, paid APIs)
    pub cost: Option<f64>,
}

/// Description of a handler for listings
#[derive(Debug, Clone)]
pub struct HandlerMetadata {
    pub description: String,
    pub category: String,
    pub outputs: Vec<PortDefinition>,
}

impl Default for HandlerMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}
