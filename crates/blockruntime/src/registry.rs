use blockcore::{BlockHandler, BlockType, HandlerMetadata, Workflow, WorkflowError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry of block handlers, one per block type
///
/// Filled once at startup, then shared read-only behind an `Arc`.
pub struct HandlerRegistry {
    handlers: BTreeMap<BlockType, Arc<dyn BlockHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Register a handler; a later registration for the same type wins.
    pub fn register(&mut self, handler: Arc<dyn BlockHandler>) {
        let block_type = handler.block_type();
        tracing::info!("Registering block type: {}", block_type);
        if self.handlers.insert(block_type, handler).is_some() {
            tracing::warn!("Handler for {} replaced", block_type);
        }
    }

    pub fn get(&self, block_type: BlockType) -> Result<Arc<dyn BlockHandler>, WorkflowError> {
        self.handlers
            .get(&block_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownBlockType(block_type.to_string()))
    }

    pub fn contains(&self, block_type: BlockType) -> bool {
        self.handlers.contains_key(&block_type)
    }

    /// Check every block up front so a run never starts half-configured.
    pub fn validate_workflow(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        for block in &workflow.blocks {
            let handler = self.get(block.block_type())?;
            handler.validate_config(&block.config).map_err(|e| {
                WorkflowError::Invalid(format!("block '{}': {}", block.id, e))
            })?;
        }
        Ok(())
    }

    /// Registered block types, in a stable order
    pub fn list_block_types(&self) -> Vec<BlockType> {
        self.handlers.keys().copied().collect()
    }

    pub fn get_metadata(&self, block_type: BlockType) -> Option<HandlerMetadata> {
        self.handlers.get(&block_type).map(|h| h.metadata())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use blockcore::{BlockConfig, BlockContext, BlockDefinition, BlockError, BlockOutput};

    struct Echo;

    #[async_trait]
    impl BlockHandler for Echo {
        fn block_type(&self) -> BlockType {
            BlockType::Function
        }

        async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
            Ok(BlockOutput::new().with_outputs(ctx.inputs))
        }
    }

    #[test]
    fn missing_handler_is_a_configuration_error() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Echo));

        assert!(registry.get(BlockType::Function).is_ok());
        assert_eq!(
            registry.get(BlockType::Agent).err(),
            Some(WorkflowError::UnknownBlockType("agent".into()))
        );

        let mut wf = Workflow::new("wf");
        wf.add_block(BlockDefinition::new("f", BlockConfig::function("passthrough")));
        wf.add_block(BlockDefinition::new("a", BlockConfig::Generic(Default::default())));
        assert_eq!(
            registry.validate_workflow(&wf),
            Err(WorkflowError::UnknownBlockType("generic".into()))
        );
    }
}
