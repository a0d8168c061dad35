use crate::condition::{expression_root, matches};
use async_trait::async_trait;
use blockcore::{
    BlockConfig, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    PortDefinition,
};

/// Sends the run down the first route whose expression holds, else the default
pub struct RouterHandler;

#[async_trait]
impl BlockHandler for RouterHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Router
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        let BlockConfig::Router(config) = &ctx.config else {
            return Err(BlockError::Configuration("router block without routes".to_string()));
        };
        let root = expression_root(&ctx);

        let mut selected = None;
        for route in &config.routes {
            if matches(&route.expression, &root)? {
                selected = Some(route.target.clone());
                break;
            }
        }
        let target = selected
            .or_else(|| config.default_route.clone())
            .ok_or_else(|| BlockError::ExecutionFailed("no route matched and no default route".to_string()))?;

        ctx.events.info(format!("Routing to {}", target));
        Ok(BlockOutput::new()
            .with_output("selectedRoute", target.clone())
            .with_route(target))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Route to one of several targets".to_string(),
            category: "logic".to_string(),
            outputs: vec![PortDefinition::new("selectedRoute", "Target picked")],
        }
    }

    fn validate_config(&self, config: &BlockConfig) -> Result<(), BlockError> {
        match config {
            BlockConfig::Router(router) if router.routes.is_empty() && router.default_route.is_none() => {
                Err(BlockError::Configuration("router has no routes".to_string()))
            }
            _ => Ok(()),
        }
    }
}
