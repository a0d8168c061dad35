use async_trait::async_trait;
use blockcore::{
    BlockConfig, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    PortDefinition, RunStatus, Value,
};
use std::collections::HashMap;

/// Runs another workflow as one block
///
/// `input` becomes the child's run inputs: an object is used as is, any
/// other value is passed as `{"input": value}`, and without it the block's
/// own inputs are forwarded.
pub struct SubWorkflowHandler;

#[async_trait]
impl BlockHandler for SubWorkflowHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Workflow
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        let BlockConfig::Workflow(config) = &ctx.config else {
            return Err(BlockError::Configuration("workflow block without workflow config".to_string()));
        };
        let runner = ctx
            .run
            .children
            .clone()
            .ok_or_else(|| BlockError::Configuration("nested workflows are not available here".to_string()))?;

        let inputs: HashMap<String, Value> = match &config.input {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => ctx.inputs.clone(),
            Some(other) => HashMap::from([("input".to_string(), other.clone())]),
        };

        ctx.events.info(format!("Starting child workflow {}", config.workflow_id));
        let child = runner.run_child(&ctx.run, config.workflow_id, inputs).await?;

        if child.status != RunStatus::Succeeded {
            return Err(BlockError::ExecutionFailed(format!(
                "child workflow {} finished {:?} (execution {})",
                config.workflow_id, child.status, child.execution_id
            )));
        }

        Ok(BlockOutput::new()
            .with_output("success", true)
            .with_output("childExecutionId", child.execution_id.to_string())
            .with_output("result", child.outputs))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Run another workflow".to_string(),
            category: "control".to_string(),
            outputs: vec![
                PortDefinition::new("result", "Final output of the child run"),
                PortDefinition::new("childExecutionId", "Execution id of the child run"),
            ],
        }
    }
}
