//! Core abstractions for the block workflow engine
//!
//! Workflow model, virtual block identities, the handler contract,
//! execution events and the persistence contracts shared by every
//! other crate. No executor lives here.

mod block;
mod error;
pub mod events;
pub mod identity;
mod snapshot;
mod store;
mod value;
mod workflow;

pub use block::{
    BlockContext, BlockHandler, BlockMetadata, BlockOutput, ChildRun, ChildWorkflowRunner,
    HandlerMetadata, IterationContext, PortDefinition, RunContext, TriggerKind,
};
pub use error::{BlockError, FlowError, StoreError, WorkflowError};
pub use events::*;
pub use identity::VirtualBlockId;
pub use snapshot::{
    BlockRecord, BlockStatus, DeploymentId, DeploymentVersion, ExecutionLog, ExecutionLookup,
    ExecutionSnapshot, RunStatus, SnapshotId,
};
pub use store::{Access, AccessPolicy, AllowAll, DeploymentStore, ExecutionLogStore, SnapshotStore};
pub use value::Value;
pub use workflow::*;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
