//! Model-backed agent block
//!
//! The handler renders nothing itself: the prompt arrives with references
//! already resolved. It hands a `CompletionRequest` to a
//! `CompletionProvider` and reports the provider's cost on the block.

use async_trait::async_trait;
use blockcore::{
    AgentConfig, BlockConfig, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType,
    HandlerMetadata, PortDefinition, Value,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub temperature: Option<f64>,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

/// Anything that can turn a prompt into text
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BlockError>;
}

/// Chat-completions client for OpenAI-compatible endpoints
pub struct OpenAiProvider {
    client: reqwest::Client,
    /// Price per 1000 tokens, prompt and completion alike
    price_per_1k_tokens: f64,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            price_per_1k_tokens: 0.0,
        }
    }

    pub fn with_price(mut self, price_per_1k_tokens: f64) -> Self {
        self.price_per_1k_tokens = price_per_1k_tokens;
        self
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BlockError> {
        let endpoint = request.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let key_env = request.api_key_env.as_deref().unwrap_or(DEFAULT_API_KEY_ENV);
        let api_key = std::env::var(key_env)
            .map_err(|_| BlockError::Configuration(format!("{} is not set", key_env)))?;

        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({"model": request.model, "messages": messages});
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", endpoint.trim_end_matches('/')))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BlockError::ExecutionFailed(format!("completion request failed: {}", e)))?;

        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BlockError::ExecutionFailed(format!("invalid completion response: {}", e)))?;
        if !status.is_success() {
            let message = payload["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(BlockError::ExecutionFailed(format!("provider returned {}: {}", status, message)));
        }

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| BlockError::ExecutionFailed("completion without content".to_string()))?
            .to_string();
        let prompt_tokens = payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let completion_tokens = payload["usage"]["completion_tokens"].as_u64().unwrap_or(0);

        Ok(Completion {
            content,
            prompt_tokens,
            completion_tokens,
            cost: (prompt_tokens + completion_tokens) as f64 / 1000.0 * self.price_per_1k_tokens,
        })
    }
}

pub struct AgentHandler {
    provider: Arc<dyn CompletionProvider>,
}

impl AgentHandler {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }
}

impl Default for AgentHandler {
    fn default() -> Self {
        Self::new(Arc::new(OpenAiProvider::new()))
    }
}

#[async_trait]
impl BlockHandler for AgentHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Agent
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        let BlockConfig::Agent(config) = &ctx.config else {
            return Err(BlockError::Configuration("agent block without agent config".to_string()));
        };
        if config.prompt.trim().is_empty() {
            return Err(BlockError::MissingInput("prompt".to_string()));
        }

        let AgentConfig {
            model,
            prompt,
            system_prompt,
            temperature,
            endpoint,
            api_key_env,
        } = config.clone();
        ctx.events.info(format!("Calling model {}", model));

        let completion = self
            .provider
            .complete(CompletionRequest {
                model: model.clone(),
                system_prompt,
                prompt,
                temperature,
                endpoint,
                api_key_env,
            })
            .await?;
        tracing::debug!(
            model = %model,
            prompt_tokens = completion.prompt_tokens,
            completion_tokens = completion.completion_tokens,
            "completion finished"
        );

        let tokens: HashMap<String, Value> = [
            ("prompt".to_string(), Value::from(completion.prompt_tokens as f64)),
            ("completion".to_string(), Value::from(completion.completion_tokens as f64)),
            (
                "total".to_string(),
                Value::from((completion.prompt_tokens + completion.completion_tokens) as f64),
            ),
        ]
        .into_iter()
        .collect();

        Ok(BlockOutput::new()
            .with_output("content", completion.content)
            .with_output("model", model)
            .with_output("tokens", tokens)
            .with_output("cost", completion.cost)
            .with_cost(completion.cost))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Ask a language model".to_string(),
            category: "ai".to_string(),
            outputs: vec![
                PortDefinition::new("content", "Model reply"),
                PortDefinition::new("tokens", "Prompt, completion and total token counts"),
                PortDefinition::new("cost", "Spend for this call"),
            ],
        }
    }

    fn validate_config(&self, config: &BlockConfig) -> Result<(), BlockError> {
        match config {
            BlockConfig::Agent(agent) if agent.model.trim().is_empty() => {
                Err(BlockError::Configuration("agent model is empty".to_string()))
            }
            BlockConfig::Agent(AgentConfig { temperature: Some(t), .. }) if !(0.0..=2.0).contains(t) => {
                Err(BlockError::Configuration(format!("temperature {} outside 0..=2", t)))
            }
            _ => Ok(()),
        }
    }
}
