use async_trait::async_trait;
use blockcore::{
    BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata, PortDefinition,
    Value,
};

/// Per-iteration results collected by the engine, plus how many there were
fn aggregate(ctx: BlockContext) -> Result<BlockOutput, BlockError> {
    let results = match ctx.inputs.get("results") {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return Err(BlockError::InvalidInputType {
                field: "results".to_string(),
                expected: "array".to_string(),
                actual: other.to_text(),
            })
        }
        None => Vec::new(),
    };

    ctx.events.info(format!("Collected {} iteration result(s)", results.len()));
    Ok(BlockOutput::new()
        .with_output("count", results.len())
        .with_output("results", results))
}

fn container_metadata(description: &str) -> HandlerMetadata {
    HandlerMetadata {
        description: description.to_string(),
        category: "control".to_string(),
        outputs: vec![
            PortDefinition::new("results", "One object per iteration, keyed by body block"),
            PortDefinition::new("count", "Number of iterations"),
        ],
    }
}

pub struct LoopHandler;

#[async_trait]
impl BlockHandler for LoopHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Loop
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        aggregate(ctx)
    }

    fn metadata(&self) -> HandlerMetadata {
        container_metadata("Repeat the body a number of times or once per item")
    }
}

pub struct ParallelHandler;

#[async_trait]
impl BlockHandler for ParallelHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Parallel
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        aggregate(ctx)
    }

    fn metadata(&self) -> HandlerMetadata {
        container_metadata("Run copies of the body concurrently")
    }
}
