//! In-memory persistence for local runs, demos and tests. Nothing here
//! survives a restart.

use async_trait::async_trait;
use blockcore::{
    DeploymentStore, DeploymentVersion, ExecutionId, ExecutionLog, ExecutionLogStore,
    ExecutionSnapshot, SnapshotId, SnapshotStore, StoreError, WorkflowId,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<SnapshotId, ExecutionSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: ExecutionSnapshot) -> Result<SnapshotId, StoreError> {
        let id = snapshot.id;
        let mut snapshots = self.snapshots.write().await;
        if snapshots.contains_key(&id) {
            return Err(StoreError::Conflict(format!("snapshot {} already stored", id)));
        }
        snapshots.insert(id, snapshot);
        Ok(id)
    }

    async fn get(&self, id: SnapshotId) -> Result<Option<ExecutionSnapshot>, StoreError> {
        Ok(self.snapshots.read().await.get(&id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryExecutionLogStore {
    logs: RwLock<Vec<ExecutionLog>>,
}

impl InMemoryExecutionLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionLogStore for InMemoryExecutionLogStore {
    async fn append(&self, log: ExecutionLog) -> Result<(), StoreError> {
        self.logs.write().await.push(log);
        Ok(())
    }

    async fn find(&self, execution_id: ExecutionId) -> Result<Option<ExecutionLog>, StoreError> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .find(|l| l.execution_id == execution_id)
            .cloned())
    }

    async fn list_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<ExecutionLog>, StoreError> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|l| l.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

/// Versions per workflow; one write lock keeps "at most one active" intact.
#[derive(Default)]
pub struct InMemoryDeploymentStore {
    versions: RwLock<HashMap<WorkflowId, Vec<DeploymentVersion>>>,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn activate(&self, mut version: DeploymentVersion) -> Result<(), StoreError> {
        let mut versions = self.versions.write().await;
        let history = versions.entry(version.workflow_id).or_default();
        for previous in history.iter_mut() {
            previous.is_active = false;
        }
        version.is_active = true;
        history.push(version);
        Ok(())
    }

    async fn versions(&self, workflow_id: WorkflowId) -> Result<Vec<DeploymentVersion>, StoreError> {
        Ok(self
            .versions
            .read()
            .await
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn only_latest_deployment_stays_active() {
        let store = InMemoryDeploymentStore::new();
        let wf = Uuid::new_v4();
        store.activate(DeploymentVersion::new(wf, json!({"v": 1}))).await.unwrap();
        store.activate(DeploymentVersion::new(wf, json!({"v": 2}))).await.unwrap();

        let versions = store.versions(wf).await.unwrap();
        assert_eq!(versions.iter().filter(|v| v.is_active).count(), 1);
        assert_eq!(store.deployed_state(wf).await.unwrap(), Some(json!({"v": 2})));
        assert_eq!(store.deployed_state(Uuid::new_v4()).await.unwrap(), None);
    }
}
