mod base;

pub use base::{BlockEvent, EventBus, EventEmitter, ExecutionEvent, ExecutionId, SkipReason};
