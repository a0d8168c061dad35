use async_trait::async_trait;
use blockcore::{
    ApiConfig, BlockConfig, BlockContext, BlockError, BlockHandler, BlockOutput, BlockType,
    HandlerMetadata, PortDefinition, Value,
};
use reqwest::Method;
use std::collections::HashMap;

/// HTTP request block
///
/// Any response status counts as success; downstream condition blocks
/// branch on `status`. Transport errors fail the block.
pub struct ApiHandler {
    client: reqwest::Client,
}

impl ApiHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ApiHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_method(method: &str) -> Result<Method, BlockError> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        "HEAD" => Ok(Method::HEAD),
        other => Err(BlockError::Configuration(format!("Unsupported method: {}", other))),
    }
}

#[async_trait]
impl BlockHandler for ApiHandler {
    fn block_type(&self) -> BlockType {
        BlockType::Api
    }

    async fn execute(&self, ctx: BlockContext) -> Result<BlockOutput, BlockError> {
        let BlockConfig::Api(ApiConfig { url, method, headers, body }) = &ctx.config else {
            return Err(BlockError::Configuration("api block without api config".to_string()));
        };
        if url.trim().is_empty() {
            return Err(BlockError::MissingInput("url".to_string()));
        }
        let method = parse_method(method)?;

        ctx.events.info(format!("{} {}", method, url));

        let mut request = self.client.request(method, url.as_str());
        for (key, value) in headers {
            request = request.header(key, value);
        }
        match body {
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(Value::Null) | None => {}
            Some(other) => request = request.json(&other.to_json()),
        }

        let response = request
            .send()
            .await
            .map_err(|e| BlockError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let headers_map: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| BlockError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        // JSON bodies stay structured so references can walk into them
        let body = serde_json::from_str::<serde_json::Value>(&body_text)
            .map(Value::from)
            .unwrap_or(Value::String(body_text));

        ctx.events.info(format!("Response status: {}", status));

        Ok(BlockOutput::new()
            .with_output("status", status as f64)
            .with_output("body", body)
            .with_output("headers", Value::Object(headers_map)))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
            outputs: vec![
                PortDefinition::new("status", "HTTP status code"),
                PortDefinition::new("body", "Response body, parsed when it is JSON"),
                PortDefinition::new("headers", "Response headers"),
            ],
        }
    }

    fn validate_config(&self, config: &BlockConfig) -> Result<(), BlockError> {
        if let BlockConfig::Api(api) = config {
            parse_method(&api.method)?;
        }
        Ok(())
    }
}
