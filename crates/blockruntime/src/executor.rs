use crate::graph::WorkflowIndex;
use crate::registry::HandlerRegistry;
use crate::resolver::{frame_path, Frame, ReferenceResolver};
use crate::state::ExecutionState;
use blockcore::identity::scoped_id;
use blockcore::{
    BlockContext, BlockDefinition, BlockError, BlockId, BlockOutput, BlockStatus, BlockType,
    ContainerSpec, EventBus, ExecutionEvent, ExecutionId, ExecutionSnapshot, FailurePolicy,
    FlowError, IterationMode, RunContext, RunStatus, SkipReason, SnapshotId, SnapshotStore,
    TriggerKind, Value, Workflow, WorkflowId, WorkflowSettings,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, FuturesUnordered, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::Instrument;

/// Executes workflows: top-level blocks as a DAG, loop and parallel
/// bodies once per iteration under virtual identities
pub struct WorkflowExecutor {
    max_parallel: usize,
    snapshots: Arc<dyn SnapshotStore>,
}

impl WorkflowExecutor {
    pub fn new(max_parallel: usize, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            snapshots,
        }
    }

    /// Execute a workflow and return results
    ///
    /// Structural and registry problems abort before any block runs. Once
    /// blocks start, failures stay local to their identity and the run
    /// always ends with a persisted snapshot.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        registry: Arc<HandlerRegistry>,
        event_bus: &EventBus,
        run: RunContext,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionResult, FlowError> {
        let index = WorkflowIndex::build(workflow)?;
        registry.validate_workflow(workflow)?;

        let execution_id = run.execution_id;
        let started_at = Utc::now();
        let start_time = Instant::now();

        event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow_id: workflow.id,
            timestamp: started_at,
        });
        tracing::info!(parent: &run.span, "Starting workflow execution: {}", workflow.id);

        let deadline = workflow.settings.max_run_duration_ms.map(|ms| {
            let token = run.cancellation.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        tracing::warn!("Run exceeded {}ms, cancelling", ms);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let shared = Arc::new(Run {
            index,
            registry,
            events: event_bus.clone(),
            settings: workflow.settings.clone(),
            max_parallel: workflow
                .settings
                .max_parallel_blocks
                .unwrap_or(self.max_parallel)
                .max(1),
            state: Mutex::new(ExecutionState::new()),
            interrupted: AtomicBool::new(false),
            ctx: run.clone(),
        });

        let outcome = run_scope(shared.clone(), None, Vec::new(), inputs)
            .instrument(run.span.clone())
            .await;
        if let Some(handle) = deadline {
            handle.abort();
        }
        outcome?;

        let (snapshot, cost) = {
            let state = shared.state.lock().await;
            let status = shared.run_status(&state);
            (state.snapshot(execution_id, workflow.id, status), state.cost())
        };
        let status = snapshot.status;
        let outputs = snapshot
            .blocks
            .iter()
            .filter(|(_, r)| r.status == BlockStatus::Succeeded)
            .map(|(id, r)| (id.clone(), r.outputs.clone()))
            .collect();
        let final_output = shared.final_output(&snapshot);

        let snapshot_id = self.snapshots.save(snapshot.clone()).await?;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id,
            status,
            duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            parent: &run.span,
            "Workflow {} finished with status {:?} in {}ms",
            workflow.id,
            status,
            duration_ms
        );

        Ok(ExecutionResult {
            execution_id,
            workflow_id: workflow.id,
            trigger: run.trigger,
            status,
            snapshot_id,
            snapshot,
            outputs,
            final_output,
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            cost,
        })
    }
}

/// Result of workflow execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub trigger: TriggerKind,
    pub status: RunStatus,
    pub snapshot_id: SnapshotId,
    pub snapshot: ExecutionSnapshot,
    /// Outputs of every succeeded identity
    pub outputs: HashMap<String, HashMap<String, Value>>,
    /// Outputs of the top-level response block, or of the top-level
    /// terminal blocks keyed by id when there is none
    pub final_output: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cost: f64,
}

impl ExecutionResult {
    pub fn block_outputs(&self, identity: &str) -> Option<&HashMap<String, Value>> {
        self.outputs.get(identity)
    }

    pub fn status_of(&self, identity: &str) -> Option<BlockStatus> {
        self.snapshot.status_of(identity)
    }

    pub fn completed_blocks(&self) -> usize {
        self.outputs.len()
    }

    pub fn total_blocks(&self) -> usize {
        self.snapshot.blocks.len()
    }
}

/// Compute the items a container iterates over.
pub fn iteration_items(spec: &ContainerSpec) -> Result<Vec<Value>, String> {
    match spec.mode {
        IterationMode::For => Ok((0..spec.count).map(Value::from).collect()),
        IterationMode::ForEach => collection_items(&spec.collection),
    }
}

fn collection_items(collection: &Value) -> Result<Vec<Value>, String> {
    match collection {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Ok(entries
                .into_iter()
                .map(|(k, v)| Value::Array(vec![Value::from(k.as_str()), v.clone()]))
                .collect())
        }
        Value::String(text) if text.trim().is_empty() => Ok(Vec::new()),
        Value::String(text) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(json @ (serde_json::Value::Array(_) | serde_json::Value::Object(_))) => {
                collection_items(&Value::from_json(json))
            }
            _ => Err(format!("collection '{}' is not a list or object", text)),
        },
        other => Err(format!("cannot iterate over '{}'", other.to_text())),
    }
}

enum Readiness {
    Waiting,
    Ready(HashMap<String, Value>),
    Skip(SkipReason),
}

/// Everything one run shares between its tasks
struct Run {
    index: WorkflowIndex,
    registry: Arc<HandlerRegistry>,
    events: EventBus,
    settings: WorkflowSettings,
    max_parallel: usize,
    state: Mutex<ExecutionState>,
    /// Set once any identity was cut short by cancellation
    interrupted: AtomicBool,
    ctx: RunContext,
}

/// Drive one scope (top level or one container iteration) to completion.
fn run_scope(
    run: Arc<Run>,
    scope: Option<BlockId>,
    frames: Vec<Frame>,
    scope_inputs: HashMap<String, Value>,
) -> BoxFuture<'static, Result<(), FlowError>> {
    Box::pin(async move {
        let path = frame_path(&frames);
        let mut waiting: Vec<BlockId> = run.index.members(scope.as_deref()).to_vec();

        {
            let mut state = run.state.lock().await;
            for id in &waiting {
                let block = run.block(id)?;
                state.register(&scoped_id(id, &path), id, block.block_type())?;
            }
        }

        let mut running = FuturesUnordered::new();
        loop {
            {
                let mut state = run.state.lock().await;

                if run.ctx.cancellation.is_cancelled() {
                    for id in waiting.drain(..) {
                        run.skip(&mut state, &scoped_id(&id, &path), SkipReason::Cancelled)?;
                    }
                }

                // Settle: skipping one block can decide its dependents.
                loop {
                    let mut progressed = false;
                    let mut still_waiting = Vec::new();
                    for id in std::mem::take(&mut waiting) {
                        if running.len() >= run.max_parallel {
                            still_waiting.push(id);
                            continue;
                        }
                        match run.readiness(&state, &id, &path, &scope_inputs) {
                            Readiness::Waiting => still_waiting.push(id),
                            Readiness::Skip(reason) => {
                                run.skip(&mut state, &scoped_id(&id, &path), reason)?;
                                progressed = true;
                            }
                            Readiness::Ready(inputs) => {
                                running.push(run.clone().start_block(id, frames.clone(), inputs));
                                progressed = true;
                            }
                        }
                    }
                    waiting = still_waiting;
                    if !progressed {
                        break;
                    }
                }
            }

            match running.next().await {
                Some(result) => result?,
                None if waiting.is_empty() => break,
                None => {
                    return Err(FlowError::Execution(format!(
                        "scope stalled with {} blocks waiting",
                        waiting.len()
                    )))
                }
            }
        }

        Ok(())
    })
}

impl Run {
    fn block(&self, id: &str) -> Result<&BlockDefinition, FlowError> {
        self.index
            .block(id)
            .ok_or_else(|| FlowError::Execution(format!("block '{}' vanished from index", id)))
    }

    /// Decide whether `id` can run yet, given its in-scope predecessors.
    fn readiness(
        &self,
        state: &ExecutionState,
        id: &str,
        path: &[(String, usize)],
        scope_inputs: &HashMap<String, Value>,
    ) -> Readiness {
        let Some(block) = self.index.block(id) else {
            return Readiness::Skip(SkipReason::UpstreamSkipped);
        };
        if !block.enabled {
            return Readiness::Skip(SkipReason::Disabled);
        }

        let incoming = self.index.incoming(id);
        if incoming.is_empty() {
            return Readiness::Ready(scope_inputs.clone());
        }

        let mut inputs = HashMap::new();
        let mut any_failed = false;
        let mut any_succeeded = false;
        for edge in incoming {
            let Some(source) = state.record(&scoped_id(&edge.source, path)) else {
                return Readiness::Waiting;
            };
            match source.status {
                BlockStatus::Pending | BlockStatus::Running => return Readiness::Waiting,
                BlockStatus::Failed => any_failed = true,
                BlockStatus::Skipped => {}
                BlockStatus::Succeeded => {
                    any_succeeded = true;
                    if edge.selected_by(source.route.as_deref()) {
                        let value = Value::Object(source.outputs.clone());
                        if let Some(name) = self.index.block(&edge.source).and_then(|b| b.reference_name()) {
                            inputs.insert(name, value.clone());
                        }
                        inputs.insert(edge.source.clone(), value);
                    }
                }
            }
        }

        if !inputs.is_empty() {
            Readiness::Ready(inputs)
        } else if any_failed {
            Readiness::Skip(SkipReason::UpstreamFailed)
        } else if any_succeeded {
            Readiness::Skip(SkipReason::BranchNotSelected)
        } else {
            Readiness::Skip(SkipReason::UpstreamSkipped)
        }
    }

    fn skip(&self, state: &mut ExecutionState, identity: &str, reason: SkipReason) -> Result<(), FlowError> {
        state.skip(identity, reason)?;
        if reason == SkipReason::Cancelled {
            self.interrupted.store(true, Ordering::SeqCst);
        }
        tracing::debug!("Block {} skipped: {}", identity, reason);
        self.events.emit(ExecutionEvent::BlockSkipped {
            execution_id: self.ctx.execution_id,
            block_id: identity.to_string(),
            reason,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn start_block(
        self: Arc<Self>,
        id: BlockId,
        frames: Vec<Frame>,
        inputs: HashMap<String, Value>,
    ) -> BoxFuture<'static, Result<(), FlowError>> {
        Box::pin(async move {
            let block = self.block(&id)?.clone();
            let identity = scoped_id(&id, &frame_path(&frames));
            if block.block_type().is_container() {
                self.run_container(block, identity, frames, inputs).await
            } else {
                self.run_block(block, identity, frames, inputs).await
            }
        })
    }

    /// Mark `identity` running and resolve its config against current state.
    async fn begin(
        &self,
        block: &BlockDefinition,
        identity: &str,
        frames: &[Frame],
    ) -> Result<Result<blockcore::BlockConfig, BlockError>, FlowError> {
        let config = {
            let mut state = self.state.lock().await;
            state.start(identity)?;
            ReferenceResolver::new(&self.index, &state, frames).resolve_config(&block.config)
        };
        self.events.emit(ExecutionEvent::BlockStarted {
            execution_id: self.ctx.execution_id,
            block_id: identity.to_string(),
            block_type: block.block_type().to_string(),
            timestamp: Utc::now(),
        });
        Ok(config)
    }

    fn context(
        &self,
        identity: &str,
        config: blockcore::BlockConfig,
        inputs: HashMap<String, Value>,
        frames: &[Frame],
    ) -> BlockContext {
        BlockContext {
            block_id: identity.to_string(),
            config,
            inputs,
            iteration: frames.last().map(Frame::to_iteration),
            run: self.ctx.clone(),
            events: self.events.create_emitter(self.ctx.execution_id, identity),
        }
    }

    async fn run_block(
        &self,
        block: BlockDefinition,
        identity: String,
        frames: Vec<Frame>,
        inputs: HashMap<String, Value>,
    ) -> Result<(), FlowError> {
        let handler = self.registry.get(block.block_type())?;
        let config = match self.begin(&block, &identity, &frames).await? {
            Ok(config) => config,
            Err(e) => return self.finish(&identity, Err(e), HashMap::new(), 0).await,
        };

        let ctx = self.context(&identity, config, inputs, &frames);
        let span = ctx.span();
        let token = self.ctx.cancellation.clone();
        let limit = self.settings.block_timeout_ms;
        let start = Instant::now();

        let task = tokio::spawn(
            async move {
                let work = async {
                    match limit {
                        Some(millis) => timeout(Duration::from_millis(millis), handler.execute(ctx))
                            .await
                            .unwrap_or_else(|_| Err(BlockError::Timeout { millis })),
                        None => handler.execute(ctx).await,
                    }
                };
                tokio::select! {
                    _ = token.cancelled() => Err(BlockError::Cancelled),
                    result = work => result,
                }
            }
            .instrument(span),
        );

        let result = task.await.unwrap_or_else(|e| {
            Err(BlockError::ExecutionFailed(format!("handler task failed: {}", e)))
        });
        let duration_ms = start.elapsed().as_millis() as u64;
        self.finish(&identity, result, HashMap::new(), duration_ms).await
    }

    /// Expand a loop or parallel: run its body once per item, then let the
    /// container's handler aggregate the per-iteration results.
    async fn run_container(
        self: Arc<Self>,
        block: BlockDefinition,
        identity: String,
        frames: Vec<Frame>,
        inputs: HashMap<String, Value>,
    ) -> Result<(), FlowError> {
        let handler = self.registry.get(block.block_type())?;
        let planned = self.begin(&block, &identity, &frames).await?.and_then(|config| {
            let spec = config
                .container()
                .unwrap_or_else(|| Err("not a container".to_string()))
                .map_err(BlockError::Configuration)?;
            let items = iteration_items(&spec).map_err(BlockError::Configuration)?;
            if items.len() > self.settings.max_iterations {
                return Err(BlockError::Configuration(format!(
                    "{} iterations exceed the limit of {}",
                    items.len(),
                    self.settings.max_iterations
                )));
            }
            Ok((config, spec, items))
        });
        let (config, spec, items) = match planned {
            Ok(planned) => planned,
            Err(e) => return self.finish(&identity, Err(e), HashMap::new(), 0).await,
        };

        let start = Instant::now();
        let total = items.len();
        tracing::debug!(
            "Expanding {} {} into {} iterations (max {} at once)",
            spec.kind.reference_prefix(),
            identity,
            total,
            spec.max_concurrency
        );

        let iterations: Vec<(Value, bool)> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let run = self.clone();
                let container_id = block.id.clone();
                let identity = identity.clone();
                let inputs = inputs.clone();
                let mut frames = frames.clone();
                frames.push(Frame {
                    kind: spec.kind,
                    container_id: container_id.clone(),
                    index,
                    item,
                    total,
                });
                async move {
                    run.events.emit(ExecutionEvent::IterationStarted {
                        execution_id: run.ctx.execution_id,
                        container_id: identity,
                        index,
                        total,
                        timestamp: Utc::now(),
                    });
                    run_scope(run.clone(), Some(container_id.clone()), frames.clone(), inputs).await?;
                    Ok::<_, FlowError>(run.iteration_result(&container_id, &frames).await)
                }
            })
            .buffered(spec.max_concurrency)
            .try_collect()
            .await?;

        let failed: Vec<usize> = iterations
            .iter()
            .enumerate()
            .filter(|(_, (_, failed))| *failed)
            .map(|(i, _)| i)
            .collect();
        let mut aggregate_inputs = inputs;
        aggregate_inputs.insert(
            "results".to_string(),
            Value::Array(iterations.into_iter().map(|(result, _)| result).collect()),
        );

        let ctx = self.context(&identity, config, aggregate_inputs, &frames);
        let span = ctx.span();
        let aggregated = handler.execute(ctx).instrument(span).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match aggregated {
            Ok(output) if self.ctx.cancellation.is_cancelled() => {
                self.finish(&identity, Err(BlockError::Cancelled), output.outputs, duration_ms).await
            }
            Ok(output) if !failed.is_empty() => {
                let error = BlockError::ExecutionFailed(format!("iterations {:?} failed", failed));
                self.finish(&identity, Err(error), output.outputs, duration_ms).await
            }
            result => self.finish(&identity, result, HashMap::new(), duration_ms).await,
        }
    }

    /// Outputs of one iteration's direct body members, and whether any failed.
    async fn iteration_result(&self, container_id: &str, frames: &[Frame]) -> (Value, bool) {
        let path = frame_path(frames);
        let state = self.state.lock().await;
        let mut outputs = HashMap::new();
        let mut failed = false;
        for member in self.index.members(Some(container_id)) {
            if let Some(record) = state.record(&scoped_id(member, &path)) {
                failed |= record.status == BlockStatus::Failed;
                if record.status == BlockStatus::Succeeded || !record.outputs.is_empty() {
                    outputs.insert(member.clone(), Value::Object(record.outputs.clone()));
                }
            }
        }
        (Value::Object(outputs), failed)
    }

    /// Record a handler outcome; `partial` is kept as outputs on failure.
    async fn finish(
        &self,
        identity: &str,
        result: Result<BlockOutput, BlockError>,
        partial: HashMap<String, Value>,
        duration_ms: u64,
    ) -> Result<(), FlowError> {
        let mut state = self.state.lock().await;
        match result {
            Ok(output) => {
                if let Some(cost) = output.metadata.cost {
                    state.add_cost(cost);
                }
                tracing::info!("Block {} completed in {}ms", identity, duration_ms);
                self.events.emit(ExecutionEvent::BlockCompleted {
                    execution_id: self.ctx.execution_id,
                    block_id: identity.to_string(),
                    outputs: output.outputs.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                state.succeed(identity, output.outputs, output.route)
            }
            Err(e) => {
                if e == BlockError::Cancelled {
                    self.interrupted.store(true, Ordering::SeqCst);
                }
                tracing::error!("Block {} failed: {}", identity, e);
                self.events.emit(ExecutionEvent::BlockFailed {
                    execution_id: self.ctx.execution_id,
                    block_id: identity.to_string(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                state.fail(identity, e.to_string(), partial)
            }
        }
    }

    fn run_status(&self, state: &ExecutionState) -> RunStatus {
        if self.interrupted.load(Ordering::SeqCst) {
            return RunStatus::Cancelled;
        }
        let failed = state.records().any(|(_, record)| {
            record.status == BlockStatus::Failed
                && match self.settings.failure_policy {
                    FailurePolicy::AnyFailure => true,
                    FailurePolicy::TerminalOnly => {
                        record.block_type == BlockType::Response || self.index.is_terminal(&record.block_id)
                    }
                }
        });
        if failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    fn final_output(&self, snapshot: &ExecutionSnapshot) -> HashMap<String, Value> {
        let top_level = self.index.members(None);
        let succeeded = |id: &String| {
            snapshot
                .block(id)
                .filter(|r| r.status == BlockStatus::Succeeded)
        };

        let responses: Vec<_> = top_level
            .iter()
            .filter(|id| self.index.block(id).map(|b| b.block_type()) == Some(BlockType::Response))
            .filter_map(succeeded)
            .collect();
        if let Some(response) = responses.last() {
            return response.outputs.clone();
        }

        top_level
            .iter()
            .filter(|id| self.index.is_terminal(id))
            .filter_map(|id| succeeded(id).map(|r| (id.clone(), Value::Object(r.outputs.clone()))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockcore::ContainerKind;
    use serde_json::json;

    fn for_each(collection: Value) -> ContainerSpec {
        ContainerSpec {
            kind: ContainerKind::Loop,
            mode: IterationMode::ForEach,
            count: 5,
            collection,
            max_concurrency: 1,
            nodes: Vec::new(),
        }
    }

    #[test]
    fn for_mode_yields_indices() {
        let spec = ContainerSpec {
            mode: IterationMode::For,
            count: 3,
            ..for_each(Value::Null)
        };
        assert_eq!(
            iteration_items(&spec).unwrap(),
            vec![Value::from(0usize), Value::from(1usize), Value::from(2usize)]
        );
    }

    #[test]
    fn for_each_accepts_arrays_objects_and_json_text() {
        let items = iteration_items(&for_each(Value::from(json!(["a", "b"])))).unwrap();
        assert_eq!(items, vec![Value::from("a"), Value::from("b")]);

        let items = iteration_items(&for_each(Value::from(json!({"y": 2, "x": 1})))).unwrap();
        assert_eq!(items[0], Value::from(json!(["x", 1])));

        let items = iteration_items(&for_each(Value::from("[1, 2, 3]"))).unwrap();
        assert_eq!(items.len(), 3);

        assert!(iteration_items(&for_each(Value::from(""))).unwrap().is_empty());
        assert!(iteration_items(&for_each(Value::from("not json"))).is_err());
        assert!(iteration_items(&for_each(Value::from(4.0))).is_err());
    }
}
