use async_trait::async_trait;
use blockcore::{
    BlockConfig, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    PortDefinition, Value,
};

/// Scores named metrics and their mean
///
/// Raw values are read from `content` (or the inputs when it is absent) by
/// metric name, which may be a dotted path. Numeric text is accepted.
pub struct EvaluatorHandler;

fn raw_score(content: &Value, name: &str) -> Result<f64, BlockError> {
    let value = content
        .get_path(name)
        .ok_or_else(|| BlockError::MissingInput(name.to_string()))?;
    match value {
        Value::Number(n) => Ok(*n),
        Value::String(s) => s.trim().parse().map_err(|_| BlockError::InvalidInputType {
            field: name.to_string(),
            expected: "number".to_string(),
            actual: format!("'{}'", s),
        }),
        other => Err(BlockError::InvalidInputType {
            field: name.to_string(),
            expected: "number".to_string(),
            actual: other.to_text(),
        }),
    }
}

#[async_trait]
impl BlockHandler for EvaluatorHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Evaluator
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        let BlockConfig::Evaluator(config) = &ctx.config else {
            return Err(BlockError::Configuration("evaluator block without metrics".to_string()));
        };
        let content = match &config.content {
            Some(Value::String(text)) => serde_json::from_str::<serde_json::Value>(text)
                .map(Value::from)
                .map_err(|e| BlockError::Configuration(format!("content is not JSON: {}", e)))?,
            Some(value) => value.clone(),
            None => ctx.inputs_value(),
        };

        let mut output = BlockOutput::new();
        let mut total = 0.0;
        for metric in &config.metrics {
            let score = raw_score(&content, &metric.name)?.clamp(metric.min, metric.max);
            total += score;
            output = output.with_output(metric.name.clone(), score);
        }
        let mean = if config.metrics.is_empty() { 0.0 } else { total / config.metrics.len() as f64 };

        ctx.events.info(format!("Scored {} metric(s), mean {:.2}", config.metrics.len(), mean));
        Ok(output.with_output("score", mean))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Score content against named metrics".to_string(),
            category: "ai".to_string(),
            outputs: vec![PortDefinition::new("score", "Mean of the clamped metric scores")],
        }
    }

    fn validate_config(&self, config: &BlockConfig) -> Result<(), BlockError> {
        let BlockConfig::Evaluator(evaluator) = config else {
            return Ok(());
        };
        if evaluator.metrics.is_empty() {
            return Err(BlockError::Configuration("evaluator has no metrics".to_string()));
        }
        for metric in &evaluator.metrics {
            if metric.min > metric.max {
                return Err(BlockError::Configuration(format!(
                    "metric '{}': min {} is above max {}",
                    metric.name, metric.min, metric.max
                )));
            }
            if metric.name == "score" {
                return Err(BlockError::Configuration("metric name 'score' is reserved".to_string()));
            }
        }
        Ok(())
    }
}
