use crate::expression;
use async_trait::async_trait;
use blockcore::{
    BlockConfig, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    PortDefinition, Value,
};

/// Branch id that always matches
pub const ELSE_BRANCH: &str = "else";

/// Object the expressions are evaluated against: inputs keyed by source,
/// plus `loop`/`parallel` with `index` and `currentItem` inside a container.
pub(crate) fn expression_root(ctx: &BlockContext) -> Value {
    let mut root = ctx.inputs.clone();
    if let Some(iteration) = &ctx.iteration {
        let frame = [
            ("index".to_string(), Value::from(iteration.index)),
            ("currentItem".to_string(), iteration.item.clone()),
            ("total".to_string(), Value::from(iteration.total)),
        ]
        .into_iter()
        .collect();
        root.insert(iteration.kind.reference_prefix().to_string(), Value::Object(frame));
    }
    Value::Object(root)
}

pub(crate) fn matches(source: &str, root: &Value) -> Result<bool, BlockError> {
    let source = source.trim();
    if source.is_empty() || source == ELSE_BRANCH {
        return Ok(true);
    }
    expression::check(source, root).map_err(|e| BlockError::Configuration(e.to_string()))
}

/// Picks the first branch whose expression holds
pub struct ConditionHandler;

#[async_trait]
impl BlockHandler for ConditionHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Condition
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        let BlockConfig::Condition(config) = &ctx.config else {
            return Err(BlockError::Configuration("condition block without branches".to_string()));
        };
        let root = expression_root(&ctx);

        for branch in &config.conditions {
            let expression = if branch.id == ELSE_BRANCH { "" } else { branch.expression.as_str() };
            if matches(expression, &root)? {
                ctx.events.info(format!("Selected branch {}", branch.id));
                return Ok(BlockOutput::new()
                    .with_output("selectedBranch", branch.id.clone())
                    .with_output("conditionResult", true)
                    .with_route(branch.id.clone()));
            }
        }

        Err(BlockError::ExecutionFailed("no condition branch matched".to_string()))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Branch on the first condition that holds".to_string(),
            category: "logic".to_string(),
            outputs: vec![PortDefinition::new("selectedBranch", "Id of the branch taken")],
        }
    }

    fn validate_config(&self, config: &BlockConfig) -> Result<(), BlockError> {
        let BlockConfig::Condition(condition) = config else {
            return Ok(());
        };
        if condition.conditions.is_empty() {
            return Err(BlockError::Configuration("condition block has no branches".to_string()));
        }
        for branch in &condition.conditions {
            let source = branch.expression.trim();
            // References are only resolved at run time, so only plain expressions are checked here
            if branch.id != ELSE_BRANCH && !source.is_empty() && source != ELSE_BRANCH && !source.contains('<') {
                expression::parse(source).map_err(|e| {
                    BlockError::Configuration(format!("branch '{}': {}", branch.id, e))
                })?;
            }
        }
        Ok(())
    }
}
