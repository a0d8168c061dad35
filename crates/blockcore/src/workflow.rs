use crate::{Value, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type BlockId = String;

/// Loop defaults, applied once when a run starts
pub const DEFAULT_LOOP_COUNT: usize = 5;
pub const DEFAULT_LOOP_CONCURRENCY: usize = 1;
pub const DEFAULT_PARALLEL_COUNT: usize = 5;
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub blocks: Vec<BlockDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            blocks: Vec::new(),
            edges: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_block(&mut self, block: BlockDefinition) -> BlockId {
        let id = block.id.clone();
        self.blocks.push(block);
        id
    }

    pub fn connect(&mut self, source: impl Into<BlockId>, target: impl Into<BlockId>) {
        self.edges.push(Edge::new(source, target));
    }

    /// Connect with a branch label, as selected by condition and router blocks.
    pub fn connect_when(
        &mut self,
        source: impl Into<BlockId>,
        target: impl Into<BlockId>,
        condition: impl Into<String>,
    ) {
        self.edges.push(Edge::new(source, target).with_condition(condition));
    }

    pub fn find_block(&self, id: &str) -> Option<&BlockDefinition> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Unique plain ids and edges that point at existing blocks.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut seen = HashSet::new();
        for block in &self.blocks {
            if block.id.is_empty() {
                return Err(WorkflowError::Invalid("block with empty id".to_string()));
            }
            if !seen.insert(block.id.as_str()) {
                return Err(WorkflowError::DuplicateBlock(block.id.clone()));
            }
            // Would collide with identities derived inside loops and parallels
            if crate::identity::decode(&block.id).is_some() {
                return Err(WorkflowError::Invalid(format!(
                    "block id '{}' has the form of a loop/parallel instance id",
                    block.id
                )));
            }
        }

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !seen.contains(end.as_str()) {
                    return Err(WorkflowError::BlockNotFound(end.clone()));
                }
            }
            if edge.source == edge.target {
                return Err(WorkflowError::InvalidConnection(format!(
                    "block '{}' is connected to itself",
                    edge.source
                )));
            }
        }

        Ok(())
    }
}

/// Closed set of block types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Agent,
    Api,
    Condition,
    Evaluator,
    Function,
    Generic,
    Loop,
    Parallel,
    Response,
    Router,
    Trigger,
    Workflow,
}

impl BlockType {
    pub const ALL: [BlockType; 12] = [
        BlockType::Agent,
        BlockType::Api,
        BlockType::Condition,
        BlockType::Evaluator,
        BlockType::Function,
        BlockType::Generic,
        BlockType::Loop,
        BlockType::Parallel,
        BlockType::Response,
        BlockType::Router,
        BlockType::Trigger,
        BlockType::Workflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Agent => "agent",
            BlockType::Api => "api",
            BlockType::Condition => "condition",
            BlockType::Evaluator => "evaluator",
            BlockType::Function => "function",
            BlockType::Generic => "generic",
            BlockType::Loop => "loop",
            BlockType::Parallel => "parallel",
            BlockType::Response => "response",
            BlockType::Router => "router",
            BlockType::Trigger => "trigger",
            BlockType::Workflow => "workflow",
        }
    }

    /// Loop and parallel blocks are expanded by the engine instead of run as steps.
    pub fn is_container(&self) -> bool {
        matches!(self, BlockType::Loop | BlockType::Parallel)
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDefinition {
    pub id: BlockId,
    #[serde(default)]
    pub name: Option<String>,
    pub config: BlockConfig,
    /// Declared output shape
    #[serde(default)]
    pub outputs: HashMap<String, OutputKind>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl BlockDefinition {
    pub fn new(id: impl Into<BlockId>, config: BlockConfig) -> Self {
        Self {
            id: id.into(),
            name: None,
            config,
            outputs: HashMap::new(),
            enabled: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, kind: OutputKind) -> Self {
        self.outputs.insert(name.into(), kind);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn block_type(&self) -> BlockType {
        self.config.block_type()
    }

    /// Name as written inside `<name.path>` references: lowercase, no spaces.
    pub fn reference_name(&self) -> Option<String> {
        self.name
            .as_ref()
            .map(|n| n.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_lowercase())
    }
}

/// Declared type of one output field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    String,
    Number,
    Boolean,
    Json,
    Array,
    Any,
}

/// Per-type block configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlockConfig {
    Agent(AgentConfig),
    Api(ApiConfig),
    Condition(ConditionConfig),
    Evaluator(EvaluatorConfig),
    Function(FunctionConfig),
    /// Schema-less escape hatch
    Generic(HashMap<String, Value>),
    Loop(LoopMetadata),
    Parallel(ParallelMetadata),
    Response(ResponseConfig),
    Router(RouterConfig),
    Trigger(TriggerConfig),
    Workflow(SubWorkflowConfig),
}

impl BlockConfig {
    pub fn block_type(&self) -> BlockType {
        match self {
            BlockConfig::Agent(_) => BlockType::Agent,
            BlockConfig::Api(_) => BlockType::Api,
            BlockConfig::Condition(_) => BlockType::Condition,
            BlockConfig::Evaluator(_) => BlockType::Evaluator,
            BlockConfig::Function(_) => BlockType::Function,
            BlockConfig::Generic(_) => BlockType::Generic,
            BlockConfig::Loop(_) => BlockType::Loop,
            BlockConfig::Parallel(_) => BlockType::Parallel,
            BlockConfig::Response(_) => BlockType::Response,
            BlockConfig::Router(_) => BlockType::Router,
            BlockConfig::Trigger(_) => BlockType::Trigger,
            BlockConfig::Workflow(_) => BlockType::Workflow,
        }
    }

    /// Resolved container settings for loop and parallel blocks.
    pub fn container(&self) -> Option<Result<ContainerSpec, String>> {
        match self {
            BlockConfig::Loop(meta) => Some(meta.resolve()),
            BlockConfig::Parallel(meta) => Some(meta.resolve()),
            _ => None,
        }
    }

    pub fn trigger(config: TriggerConfig) -> Self {
        BlockConfig::Trigger(config)
    }

    pub fn function(name: impl Into<String>) -> Self {
        BlockConfig::Function(FunctionConfig {
            function: name.into(),
            args: HashMap::new(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// OpenAI-compatible base URL; provider default when absent
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    pub conditions: Vec<ConditionBranch>,
}

/// One `if` / `else if` / `else` arm; `expression` of `else` (or empty) always matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionBranch {
    pub id: String,
    #[serde(default)]
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorConfig {
    pub metrics: Vec<EvaluatorMetric>,
    /// Object holding the raw metric values; falls back to the block inputs
    #[serde(default)]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorMetric {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub min: f64,
    #[serde(default = "default_metric_max")]
    pub max: f64,
}

fn default_metric_max() -> f64 {
    10.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfig {
    /// Name of a function registered with the function handler
    pub function: String,
    #[serde(default)]
    pub args: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseConfig {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    pub routes: Vec<Route>,
    #[serde(default)]
    pub default_route: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Edge label or target block id selected when `expression` holds
    pub target: String,
    #[serde(default)]
    pub expression: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    /// Values used when the run inputs do not provide them
    #[serde(default)]
    pub defaults: HashMap<String, Value>,
    /// Cron expression for scheduled runs
    #[serde(default)]
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubWorkflowConfig {
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub input: Option<Value>,
}

/// Iteration mode shared by loops and parallels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IterationMode {
    #[default]
    For,
    ForEach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Loop,
    Parallel,
}

impl ContainerKind {
    /// Prefix of the `<loop.index>` / `<parallel.index>` references
    pub fn reference_prefix(&self) -> &'static str {
        match self {
            ContainerKind::Loop => "loop",
            ContainerKind::Parallel => "parallel",
        }
    }
}

/// Loop metadata as authored; missing fields take the loop defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoopMetadata {
    pub loop_type: Option<IterationMode>,
    pub count: Option<usize>,
    /// Array, object, JSON text or a `<ref.path>` expression
    pub collection: Option<Value>,
    pub max_concurrency: Option<usize>,
    /// Direct body members
    #[serde(default)]
    pub nodes: Vec<BlockId>,
}

impl LoopMetadata {
    pub fn resolve(&self) -> Result<ContainerSpec, String> {
        let max_concurrency = self.max_concurrency.unwrap_or(DEFAULT_LOOP_CONCURRENCY);
        if max_concurrency == 0 {
            return Err("maxConcurrency must be at least 1".to_string());
        }
        Ok(ContainerSpec {
            kind: ContainerKind::Loop,
            mode: self.loop_type.unwrap_or_default(),
            count: self.count.unwrap_or(DEFAULT_LOOP_COUNT),
            collection: self.collection.clone().unwrap_or_else(|| Value::String(String::new())),
            max_concurrency,
            nodes: self.nodes.clone(),
        })
    }
}

/// Parallel metadata as authored; without `maxConcurrency` every branch runs at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParallelMetadata {
    pub parallel_type: Option<IterationMode>,
    pub count: Option<usize>,
    pub collection: Option<Value>,
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub nodes: Vec<BlockId>,
}

impl ParallelMetadata {
    pub fn resolve(&self) -> Result<ContainerSpec, String> {
        if self.max_concurrency == Some(0) {
            return Err("maxConcurrency must be at least 1".to_string());
        }
        Ok(ContainerSpec {
            kind: ContainerKind::Parallel,
            mode: self.parallel_type.unwrap_or_default(),
            count: self.count.unwrap_or(DEFAULT_PARALLEL_COUNT),
            collection: self.collection.clone().unwrap_or_else(|| Value::String(String::new())),
            max_concurrency: self.max_concurrency.unwrap_or(usize::MAX),
            nodes: self.nodes.clone(),
        })
    }
}

/// Container settings with every default applied
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub kind: ContainerKind,
    pub mode: IterationMode,
    pub count: usize,
    pub collection: Value,
    pub max_concurrency: usize,
    pub nodes: Vec<BlockId>,
}

/// Directed edge between two blocks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: BlockId,
    pub target: BlockId,
    /// Branch or route label
    #[serde(default)]
    pub condition: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<BlockId>, target: impl Into<BlockId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Whether this edge stays active once its source picked `route`.
    pub fn selected_by(&self, route: Option<&str>) -> bool {
        match route {
            None => true,
            Some(route) => self.condition.as_deref() == Some(route) || self.target == route,
        }
    }
}

/// Per-workflow execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowSettings {
    /// Per-block handler deadline
    pub block_timeout_ms: Option<u64>,
    /// Whole-run deadline; the run is cancelled when it passes
    pub max_run_duration_ms: Option<u64>,
    /// Overrides the runtime's top-level parallelism
    pub max_parallel_blocks: Option<usize>,
    pub max_iterations: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            block_timeout_ms: None,
            max_run_duration_ms: None,
            max_parallel_blocks: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            failure_policy: FailurePolicy::AnyFailure,
        }
    }
}

/// Which failed blocks mark the whole run as failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    #[default]
    AnyFailure,
    /// Only response blocks and blocks without outgoing edges
    TerminalOnly,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loop_without_fields_takes_defaults() {
        let block: BlockDefinition =
            serde_json::from_value(json!({"id": "l1", "config": {"type": "loop"}})).unwrap();
        let spec = block.config.container().unwrap().unwrap();
        assert_eq!(spec.kind, ContainerKind::Loop);
        assert_eq!(spec.mode, IterationMode::For);
        assert_eq!(spec.count, 5);
        assert_eq!(spec.collection, Value::String(String::new()));
        assert_eq!(spec.max_concurrency, 1);
    }

    #[test]
    fn parallel_rejects_zero_concurrency() {
        let meta = ParallelMetadata {
            max_concurrency: Some(0),
            ..Default::default()
        };
        assert!(meta.resolve().is_err());
    }

    #[test]
    fn config_tag_decides_block_type() {
        let block: BlockDefinition = serde_json::from_value(json!({
            "id": "route",
            "name": "Pick Route",
            "config": {"type": "router", "routes": [{"target": "a", "expression": "x > 1"}]}
        }))
        .unwrap();
        assert_eq!(block.block_type(), BlockType::Router);
        assert_eq!(block.reference_name().as_deref(), Some("pickroute"));
        assert!(block.enabled);
    }

    #[test]
    fn unknown_block_type_fails_to_load() {
        let result: Result<BlockDefinition, _> =
            serde_json::from_value(json!({"id": "x", "config": {"type": "teleport"}}));
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_dangling_edges_and_duplicates() {
        let mut wf = Workflow::new("wf");
        wf.add_block(BlockDefinition::new("a", BlockConfig::Generic(HashMap::new())));
        wf.connect("a", "ghost");
        assert_eq!(wf.validate(), Err(WorkflowError::BlockNotFound("ghost".into())));

        let mut wf = Workflow::new("wf");
        wf.add_block(BlockDefinition::new("a", BlockConfig::Generic(HashMap::new())));
        wf.add_block(BlockDefinition::new("a", BlockConfig::Generic(HashMap::new())));
        assert_eq!(wf.validate(), Err(WorkflowError::DuplicateBlock("a".into())));
    }

    #[test]
    fn edge_selection_by_label_or_target() {
        let labeled = Edge::new("c", "yes").with_condition("if");
        assert!(labeled.selected_by(None));
        assert!(labeled.selected_by(Some("if")));
        assert!(!labeled.selected_by(Some("else")));

        let plain = Edge::new("r", "billing");
        assert!(plain.selected_by(Some("billing")));
        assert!(!plain.selected_by(Some("support")));
    }
}
