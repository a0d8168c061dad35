use crate::block::TriggerKind;
use crate::events::{ExecutionId, SkipReason};
use crate::workflow::{BlockType, WorkflowId};
use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub type SnapshotId = Uuid;
pub type DeploymentId = Uuid;

/// Lifecycle of one (possibly virtual) block identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl BlockStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BlockStatus::Succeeded | BlockStatus::Failed | BlockStatus::Skipped)
    }

    pub fn can_transition_to(&self, next: BlockStatus) -> bool {
        matches!(
            (self, next),
            (BlockStatus::Pending, BlockStatus::Running)
                | (BlockStatus::Pending, BlockStatus::Skipped)
                | (BlockStatus::Running, BlockStatus::Succeeded)
                | (BlockStatus::Running, BlockStatus::Failed)
        )
    }
}

/// Final status of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// State of one block identity inside a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    /// Id of the block definition
    pub block_id: String,
    pub block_type: BlockType,
    pub status: BlockStatus,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Route picked by a condition or router block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Immutable capture of a run's final state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub id: SnapshotId,
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Keyed by block identity, virtual ones included
    pub blocks: BTreeMap<String, BlockRecord>,
}

impl BlockRecord {
    pub fn new(block_id: impl Into<String>, block_type: BlockType) -> Self {
        Self {
            block_id: block_id.into(),
            block_type,
            status: BlockStatus::Pending,
            outputs: HashMap::new(),
            error: None,
            route: None,
            skip_reason: None,
            started_at: None,
            ended_at: None,
        }
    }
}

impl ExecutionSnapshot {
    pub fn block(&self, identity: &str) -> Option<&BlockRecord> {
        self.blocks.get(identity)
    }

    pub fn status_of(&self, identity: &str) -> Option<BlockStatus> {
        self.blocks.get(identity).map(|r| r.status)
    }

    /// The serialized form handed to log viewers
    pub fn state_data(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Execution log row behind the execution lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub snapshot_id: SnapshotId,
    pub trigger: TriggerKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub cost: f64,
}

/// Answer to "what happened in execution X"
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLookup {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub state_data: serde_json::Value,
    pub trigger: TriggerKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub cost: f64,
}

impl ExecutionLookup {
    pub fn new(log: &ExecutionLog, snapshot: &ExecutionSnapshot) -> Self {
        Self {
            execution_id: log.execution_id,
            workflow_id: log.workflow_id,
            state_data: snapshot.state_data(),
            trigger: log.trigger,
            status: log.status,
            started_at: log.started_at,
            ended_at: log.ended_at,
            total_duration_ms: log.total_duration_ms,
            cost: log.cost,
        }
    }
}

/// One published configuration of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVersion {
    pub id: DeploymentId,
    pub workflow_id: WorkflowId,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub state_snapshot: serde_json::Value,
}

impl DeploymentVersion {
    pub fn new(workflow_id: WorkflowId, state_snapshot: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            created_at: Utc::now(),
            is_active: true,
            state_snapshot,
        }
    }
}
