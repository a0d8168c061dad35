use async_trait::async_trait;
use blockcore::{
    BlockConfig, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
};

/// Entry point of a run: run inputs layered over the configured defaults
pub struct TriggerHandler;

#[async_trait]
impl BlockHandler for TriggerHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Trigger
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        let defaults = match &ctx.config {
            BlockConfig::Trigger(config) => config.defaults.clone(),
            _ => Default::default(),
        };

        let mut outputs = defaults;
        outputs.extend(ctx.inputs);
        ctx.events.info(format!("Triggered by {} with {} field(s)", ctx.run.trigger, outputs.len()));

        Ok(BlockOutput::new().with_outputs(outputs))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Starts a workflow with the run inputs".to_string(),
            category: "trigger".to_string(),
            outputs: vec![],
        }
    }

    fn validate_config(&self, config: &BlockConfig) -> Result<(), BlockError> {
        if let BlockConfig::Trigger(trigger) = config {
            if let Some(schedule) = &trigger.schedule {
                if schedule.split_whitespace().count() < 5 {
                    return Err(BlockError::Configuration(format!(
                        "schedule '{}' is not a cron expression",
                        schedule
                    )));
                }
            }
        }
        Ok(())
    }
}
