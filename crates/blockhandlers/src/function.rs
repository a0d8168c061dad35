use async_trait::async_trait;
use blockcore::{
    BlockConfig, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType, HandlerMetadata,
    Value,
};
use std::collections::HashMap;
use std::sync::Arc;

/// A named function: `(args, inputs) -> outputs`
pub type FunctionFn = Arc<
    dyn Fn(&HashMap<String, Value>, &HashMap<String, Value>) -> Result<HashMap<String, Value>, BlockError>
        + Send
        + Sync,
>;

/// Runs functions from a fixed table, chosen by `config.function`
pub struct FunctionHandler {
    functions: HashMap<String, FunctionFn>,
}

impl FunctionHandler {
    /// Table with the built-ins: `passthrough`, `sum`, `concat`, `template`
    pub fn new() -> Self {
        let handler = Self {
            functions: HashMap::new(),
        };
        handler
            .with_function("passthrough", passthrough)
            .with_function("sum", sum)
            .with_function("concat", concat)
            .with_function("template", template)
    }

    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&HashMap<String, Value>, &HashMap<String, Value>) -> Result<HashMap<String, Value>, BlockError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FunctionHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn single(name: &str, value: impl Into<Value>) -> HashMap<String, Value> {
    HashMap::from([(name.to_string(), value.into())])
}

/// Inputs with args layered on top
fn passthrough(
    args: &HashMap<String, Value>,
    inputs: &HashMap<String, Value>,
) -> Result<HashMap<String, Value>, BlockError> {
    let mut outputs = inputs.clone();
    outputs.extend(args.clone());
    Ok(outputs)
}

/// `args.values` when given, otherwise every numeric arg
fn sum(
    args: &HashMap<String, Value>,
    _inputs: &HashMap<String, Value>,
) -> Result<HashMap<String, Value>, BlockError> {
    let numbers: Vec<&Value> = match args.get("values") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => {
            return Err(BlockError::InvalidInputType {
                field: "values".to_string(),
                expected: "array".to_string(),
                actual: other.to_text(),
            })
        }
        None => args.values().filter(|v| matches!(v, Value::Number(_))).collect(),
    };

    let mut total = 0.0;
    for value in numbers {
        total += match value {
            Value::Number(n) => *n,
            Value::String(s) => s.trim().parse().map_err(|_| BlockError::InvalidInputType {
                field: "values".to_string(),
                expected: "number".to_string(),
                actual: s.clone(),
            })?,
            other => {
                return Err(BlockError::InvalidInputType {
                    field: "values".to_string(),
                    expected: "number".to_string(),
                    actual: other.to_text(),
                })
            }
        };
    }
    Ok(single("sum", total))
}

fn concat(
    args: &HashMap<String, Value>,
    _inputs: &HashMap<String, Value>,
) -> Result<HashMap<String, Value>, BlockError> {
    let Some(Value::Array(items)) = args.get("values") else {
        return Err(BlockError::MissingInput("values".to_string()));
    };
    let separator = args.get("separator").map(Value::to_text).unwrap_or_default();
    let joined = items.iter().map(Value::to_text).collect::<Vec<_>>().join(&separator);
    Ok(single("result", joined))
}

/// Fills `{{name}}` placeholders in `args.template` from args, then inputs
fn template(
    args: &HashMap<String, Value>,
    inputs: &HashMap<String, Value>,
) -> Result<HashMap<String, Value>, BlockError> {
    let source = args
        .get("template")
        .and_then(Value::as_str)
        .ok_or_else(|| BlockError::MissingInput("template".to_string()))?;

    let mut rendered = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            rendered.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let key = after[..end].trim();
        let (head, path) = key.split_once('.').unwrap_or((key, ""));
        let value = args
            .get(head)
            .or_else(|| inputs.get(head))
            .and_then(|v| v.get_path(path));
        rendered.push_str(&value.map(Value::to_text).unwrap_or_default());
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);

    Ok(single("result", rendered))
}

#[async_trait]
impl BlockHandler for FunctionHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Function
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        let BlockConfig::Function(config) = &ctx.config else {
            return Err(BlockError::Configuration("function block without function config".to_string()));
        };
        let function = self
            .functions
            .get(&config.function)
            .ok_or_else(|| BlockError::Configuration(format!("unknown function '{}'", config.function)))?;

        let outputs = function(&config.args, &ctx.inputs)?;
        Ok(BlockOutput::new().with_outputs(outputs))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: format!("Run a named function ({})", self.names().join(", ")),
            category: "transform".to_string(),
            outputs: vec![],
        }
    }

    fn validate_config(&self, config: &BlockConfig) -> Result<(), BlockError> {
        match config {
            BlockConfig::Function(f) if !self.functions.contains_key(&f.function) => {
                Err(BlockError::Configuration(format!("unknown function '{}'", f.function)))
            }
            _ => Ok(()),
        }
    }
}
