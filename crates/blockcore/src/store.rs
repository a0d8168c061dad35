use crate::events::ExecutionId;
use crate::snapshot::{DeploymentVersion, ExecutionLog, ExecutionSnapshot, SnapshotId};
use crate::workflow::WorkflowId;
use crate::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Persists the snapshot produced when a run reaches its terminal state
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: ExecutionSnapshot) -> Result<SnapshotId, StoreError>;

    async fn get(&self, id: SnapshotId) -> Result<Option<ExecutionSnapshot>, StoreError>;
}

/// Execution log rows, one per finished run
#[async_trait]
pub trait ExecutionLogStore: Send + Sync {
    async fn append(&self, log: ExecutionLog) -> Result<(), StoreError>;

    async fn find(&self, execution_id: ExecutionId) -> Result<Option<ExecutionLog>, StoreError>;

    async fn list_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<ExecutionLog>, StoreError>;
}

/// Published workflow versions
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Store `version` as the active one, deactivating any previous version
    /// of the same workflow.
    async fn activate(&self, version: DeploymentVersion) -> Result<(), StoreError>;

    async fn versions(&self, workflow_id: WorkflowId) -> Result<Vec<DeploymentVersion>, StoreError>;

    /// State of the most recently created active version, if any.
    async fn deployed_state(&self, workflow_id: WorkflowId) -> Result<Option<serde_json::Value>, StoreError> {
        let versions = self.versions(workflow_id).await?;
        Ok(versions
            .into_iter()
            .filter(|v| v.is_active)
            .max_by_key(|v| v.created_at)
            .map(|v| v.state_snapshot))
    }
}

/// Outcome of a permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Allow,
    Deny,
}

impl Access {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Access::Allow)
    }
}

/// Decides whether an actor may touch a workflow
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn check(&self, actor: &str, workflow_id: WorkflowId) -> Access;
}

/// Policy that lets everyone through
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessPolicy for AllowAll {
    async fn check(&self, _actor: &str, _workflow_id: WorkflowId) -> Access {
        Access::Allow
    }
}
