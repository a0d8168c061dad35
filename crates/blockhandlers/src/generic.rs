use async_trait::async_trait;
use blockcore::{BlockConfig, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata};

/// Emits its inputs with the (resolved) config map on top
pub struct GenericHandler;

#[async_trait]
impl BlockHandler for GenericHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Generic
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        let mut outputs = ctx.inputs;
        if let BlockConfig::Generic(config) = ctx.config {
            outputs.extend(config);
        }
        Ok(BlockOutput::new().with_outputs(outputs))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Pass values through unchanged".to_string(),
            category: "general".to_string(),
            outputs: vec![],
        }
    }
}
