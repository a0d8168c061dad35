use async_trait::async_trait;
use blockcore::{
    BlockConfig, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    PortDefinition, Value,
};
use std::collections::HashMap;

/// Shapes the workflow's final answer
pub struct ResponseHandler;

#[async_trait]
impl BlockHandler for ResponseHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Response
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        let BlockConfig::Response(config) = &ctx.config else {
            return Err(BlockError::Configuration("response block without response config".to_string()));
        };

        let data = match &config.data {
            Some(data) => data.clone(),
            None => ctx.inputs_value(),
        };
        let headers: HashMap<String, Value> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();

        Ok(BlockOutput::new()
            .with_output("data", data)
            .with_output("status", config.status as f64)
            .with_output("headers", headers))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Return data from the workflow".to_string(),
            category: "output".to_string(),
            outputs: vec![
                PortDefinition::new("data", "Response payload"),
                PortDefinition::new("status", "HTTP-style status code"),
                PortDefinition::new("headers", "Response headers"),
            ],
        }
    }

    fn validate_config(&self, config: &BlockConfig) -> Result<(), BlockError> {
        match config {
            BlockConfig::Response(response) if !(100..=599).contains(&response.status) => Err(
                BlockError::Configuration(format!("status {} is not an HTTP status", response.status)),
            ),
            _ => Ok(()),
        }
    }
}
