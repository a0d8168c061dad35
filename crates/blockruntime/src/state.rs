use blockcore::{
    BlockRecord, BlockStatus, BlockType, ExecutionId, ExecutionSnapshot, FlowError, RunStatus,
    SkipReason, Value, WorkflowId,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Mutable state of one run, keyed by block identity
///
/// Owned by a single run; its tasks share it behind a mutex.
#[derive(Debug, Default)]
pub struct ExecutionState {
    records: BTreeMap<String, BlockRecord>,
    cost: f64,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pending record; an identity can only be registered once per run.
    pub fn register(&mut self, identity: &str, block_id: &str, block_type: BlockType) -> Result<(), FlowError> {
        if self.records.contains_key(identity) {
            return Err(FlowError::Execution(format!(
                "identity '{}' registered twice",
                identity
            )));
        }
        self.records
            .insert(identity.to_string(), BlockRecord::new(block_id, block_type));
        Ok(())
    }

    pub fn start(&mut self, identity: &str) -> Result<(), FlowError> {
        let record = self.transition(identity, BlockStatus::Running)?;
        record.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn succeed(
        &mut self,
        identity: &str,
        outputs: HashMap<String, Value>,
        route: Option<String>,
    ) -> Result<(), FlowError> {
        let record = self.transition(identity, BlockStatus::Succeeded)?;
        record.outputs = outputs;
        record.route = route;
        record.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a running identity failed; containers keep their partial outputs.
    pub fn fail(
        &mut self,
        identity: &str,
        error: impl Into<String>,
        outputs: HashMap<String, Value>,
    ) -> Result<(), FlowError> {
        let record = self.transition(identity, BlockStatus::Failed)?;
        record.error = Some(error.into());
        record.outputs = outputs;
        record.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn skip(&mut self, identity: &str, reason: SkipReason) -> Result<(), FlowError> {
        let record = self.transition(identity, BlockStatus::Skipped)?;
        record.skip_reason = Some(reason);
        record.ended_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, identity: &str, next: BlockStatus) -> Result<&mut BlockRecord, FlowError> {
        let record = self
            .records
            .get_mut(identity)
            .ok_or_else(|| FlowError::Execution(format!("unknown identity '{}'", identity)))?;
        if !record.status.can_transition_to(next) {
            return Err(FlowError::Execution(format!(
                "illegal transition {:?} -> {:?} for '{}'",
                record.status, next, identity
            )));
        }
        record.status = next;
        Ok(record)
    }

    pub fn record(&self, identity: &str) -> Option<&BlockRecord> {
        self.records.get(identity)
    }

    pub fn status(&self, identity: &str) -> Option<BlockStatus> {
        self.records.get(identity).map(|r| r.status)
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &BlockRecord)> {
        self.records.iter()
    }

    pub fn all_terminal(&self) -> bool {
        self.records.values().all(|r| r.status.is_terminal())
    }

    pub fn add_cost(&mut self, cost: f64) {
        self.cost += cost;
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn snapshot(&self, execution_id: ExecutionId, workflow_id: WorkflowId, status: RunStatus) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: Uuid::new_v4(),
            execution_id,
            workflow_id,
            created_at: Utc::now(),
            status,
            blocks: self.records.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_cannot_be_registered_twice() {
        let mut state = ExecutionState::new();
        state.register("a", "a", BlockType::Function).unwrap();
        assert!(state.register("a", "a", BlockType::Function).is_err());
        state
            .register("a_parallel_l_iteration_0", "a", BlockType::Function)
            .unwrap();
    }

    #[test]
    fn illegal_transitions_are_errors() {
        let mut state = ExecutionState::new();
        state.register("a", "a", BlockType::Function).unwrap();
        assert!(state.succeed("a", HashMap::new(), None).is_err());

        state.start("a").unwrap();
        assert!(state.skip("a", SkipReason::Cancelled).is_err());
        state.succeed("a", HashMap::new(), Some("if".into())).unwrap();
        assert!(state.start("a").is_err());

        let record = state.record("a").unwrap();
        assert_eq!(record.status, BlockStatus::Succeeded);
        assert_eq!(record.route.as_deref(), Some("if"));
        assert!(state.all_terminal());
    }
}
