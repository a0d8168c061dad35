use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Configuration-class errors abort a run before any block executes.
    pub fn is_configuration(&self) -> bool {
        matches!(self, FlowError::Workflow(_))
    }
}

/// Failure of a single block handler; local to one block identity.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

/// Problems with the workflow definition itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Duplicate block id: {0}")]
    DuplicateBlock(String),

    #[error("Unknown block type: {0}")]
    UnknownBlockType(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Invalid container '{block_id}': {reason}")]
    InvalidContainer { block_id: String, reason: String },

    #[error("No deployed version for workflow {0}")]
    NotDeployed(String),
}

/// Errors raised by persistence collaborators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Backend error: {0}")]
    Backend(String),
}
