//! Built-in block handlers
//!
//! One handler per block type. The engine stays type-agnostic; everything
//! a block actually does lives here.

mod agent;
mod api;
mod condition;
mod container;
mod evaluator;
pub mod expression;
mod function;
mod generic;
mod response;
mod router;
mod trigger;
mod workflow;

pub use agent::{AgentHandler, Completion, CompletionProvider, CompletionRequest, OpenAiProvider};
pub use api::ApiHandler;
pub use condition::{ConditionHandler, ELSE_BRANCH};
pub use container::{LoopHandler, ParallelHandler};
pub use evaluator::EvaluatorHandler;
pub use function::{FunctionFn, FunctionHandler};
pub use generic::GenericHandler;
pub use response::ResponseHandler;
pub use router::RouterHandler;
pub use trigger::TriggerHandler;
pub use workflow::SubWorkflowHandler;

use blockruntime::HandlerRegistry;
use std::sync::Arc;

/// Register every built-in handler, with the default OpenAI-compatible agent provider
pub fn register_all(registry: &mut HandlerRegistry) {
    register_with_provider(registry, Arc::new(OpenAiProvider::new()));
}

/// Register every built-in handler, answering agent blocks with `provider`
pub fn register_with_provider(registry: &mut HandlerRegistry, provider: Arc<dyn CompletionProvider>) {
    registry.register(Arc::new(AgentHandler::new(provider)));
    registry.register(Arc::new(ApiHandler::new()));
    registry.register(Arc::new(ConditionHandler));
    registry.register(Arc::new(EvaluatorHandler));
    registry.register(Arc::new(FunctionHandler::new()));
    registry.register(Arc::new(GenericHandler));
    registry.register(Arc::new(LoopHandler));
    registry.register(Arc::new(ParallelHandler));
    registry.register(Arc::new(ResponseHandler));
    registry.register(Arc::new(RouterHandler));
    registry.register(Arc::new(TriggerHandler));
    registry.register(Arc::new(SubWorkflowHandler));
}
