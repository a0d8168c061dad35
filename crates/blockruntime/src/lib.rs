//! Workflow execution runtime
//!
//! Handler registry, the execution engine that expands loops and
//! parallels into virtual block identities, reference resolution,
//! in-memory stores and the `FlowRuntime` facade.

mod executor;
mod graph;
mod registry;
mod resolver;
mod runtime;
mod state;
pub mod stores;

pub use executor::{iteration_items, ExecutionResult, WorkflowExecutor};
pub use graph::WorkflowIndex;
pub use registry::HandlerRegistry;
pub use resolver::{frame_path, Frame, ReferenceResolver};
pub use runtime::{FlowRuntime, RuntimeConfig, MAX_WORKFLOW_DEPTH};
pub use state::ExecutionState;
