use crate::snapshot::RunStatus;
use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted during workflow execution
///
/// `block_id` is always the full identity, so loop and parallel
/// instances of one definition stay distinguishable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    WorkflowStarted {
        execution_id: ExecutionId,
        workflow_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        execution_id: ExecutionId,
        status: RunStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    BlockStarted {
        execution_id: ExecutionId,
        block_id: String,
        block_type: String,
        timestamp: DateTime<Utc>,
    },
    BlockCompleted {
        execution_id: ExecutionId,
        block_id: String,
        outputs: HashMap<String, Value>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    BlockFailed {
        execution_id: ExecutionId,
        block_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    BlockSkipped {
        execution_id: ExecutionId,
        block_id: String,
        reason: SkipReason,
        timestamp: DateTime<Utc>,
    },
    IterationStarted {
        execution_id: ExecutionId,
        container_id: String,
        index: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },
    BlockEvent {
        execution_id: ExecutionId,
        block_id: String,
        event: BlockEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::WorkflowStarted { execution_id, .. }
            | ExecutionEvent::WorkflowCompleted { execution_id, .. }
            | ExecutionEvent::BlockStarted { execution_id, .. }
            | ExecutionEvent::BlockCompleted { execution_id, .. }
            | ExecutionEvent::BlockFailed { execution_id, .. }
            | ExecutionEvent::BlockSkipped { execution_id, .. }
            | ExecutionEvent::IterationStarted { execution_id, .. }
            | ExecutionEvent::BlockEvent { execution_id, .. } => *execution_id,
        }
    }
}

/// Why a block was skipped instead of run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    UpstreamFailed,
    UpstreamSkipped,
    BranchNotSelected,
    Disabled,
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::UpstreamFailed => "upstream failed",
            SkipReason::UpstreamSkipped => "upstream skipped",
            SkipReason::BranchNotSelected => "branch not selected",
            SkipReason::Disabled => "block disabled",
            SkipReason::Cancelled => "run cancelled",
        };
        f.write_str(s)
    }
}

/// Events a handler reports while it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum BlockEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
    Data { port: String, value: Value },
}

/// Event emitter handed to each block identity
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    block_id: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        block_id: impl Into<String>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            block_id: block_id.into(),
            sender,
        }
    }

    /// Emitter whose events go nowhere; handy for handler unit tests.
    pub fn detached(block_id: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self::new(Uuid::nil(), block_id, sender)
    }

    pub fn emit(&self, event: BlockEvent) {
        let _ = self.sender.send(ExecutionEvent::BlockEvent {
            execution_id: self.execution_id,
            block_id: self.block_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(BlockEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(BlockEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(BlockEvent::Progress { percent, message });
    }

    /// Emit data on a named port (for streaming)
    pub fn data(&self, port: impl Into<String>, value: Value) {
        self.emit(BlockEvent::Data {
            port: port.into(),
            value,
        });
    }
}

/// Process-wide broadcast of execution events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, block_id: impl Into<String>) -> EventEmitter {
        EventEmitter::new(execution_id, block_id, self.sender.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_tags_events_with_identity() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let exec = Uuid::new_v4();
        let emitter = bus.create_emitter(exec, "add_parallel_loop_iteration_2");

        emitter.info("hello");

        match rx.recv().await.unwrap() {
            ExecutionEvent::BlockEvent { execution_id, block_id, event, .. } => {
                assert_eq!(execution_id, exec);
                assert_eq!(block_id, "add_parallel_loop_iteration_2");
                assert!(matches!(event, BlockEvent::Info { message } if message == "hello"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn skip_reason_serializes_camel_case() {
        let json = serde_json::to_string(&SkipReason::BranchNotSelected).unwrap();
        assert_eq!(json, "\"branchNotSelected\"");
    }
}
