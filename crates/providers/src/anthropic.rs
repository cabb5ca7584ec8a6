//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly (not an OpenAI-compatible proxy):
//! `x-api-key` header authentication, `anthropic-version` header, system
//! prompt as a top-level field, and `max_tokens` as a required parameter.

use crate::catalog::ModelCatalog;
use async_trait::async_trait;
use costrail_core::error::ProviderError;
use costrail_core::message::{Message, Role};
use costrail_core::provider::*;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Anthropic Messages API provider.
pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    catalog: ModelCatalog,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
            catalog: ModelCatalog::anthropic_defaults(),
        })
    }

    /// Use a custom base URL (testing, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Replace the built-in model catalog.
    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Anthropic carries the system prompt as a top-level field, not as a
    /// message. Split it out and convert the rest.
    fn split_messages(messages: &[Message]) -> (Option<String>, Vec<serde_json::Value>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut api_messages = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                Role::User => api_messages.push(json!({
                    "role": "user",
                    "content": msg.content,
                })),
                Role::Assistant => api_messages.push(json!({
                    "role": "assistant",
                    "content": msg.content,
                })),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        (system, api_messages)
    }

    fn map_error_status(status: u16, model: &str, body: String) -> ProviderError {
        match status {
            429 => ProviderError::RateLimited { retry_after_secs: 5 },
            401 | 403 => {
                ProviderError::AuthenticationFailed("Invalid Anthropic API key".into())
            }
            404 => ProviderError::ModelNotFound(model.to_string()),
            _ => ProviderError::Api {
                status_code: status,
                message: body,
            },
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn validate_connection(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let (system, messages) = Self::split_messages(&request.messages);

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }

        debug!(provider = "anthropic", model = %request.model, "Sending chat request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(Self::map_error_status(status, &request.model, error_body));
        }

        let api_resp: AnthropicResponse =
            response.json().await.map_err(|e| ProviderError::Api {
                status_code: 200,
                message: format!("Failed to parse Anthropic response: {e}"),
            })?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            content,
            model: api_resp.model,
            input_tokens: api_resp.usage.input_tokens,
            output_tokens: api_resp.usage.output_tokens,
            finish_reason: api_resp.stop_reason,
            metadata: serde_json::Map::new(),
        })
    }

    async fn count_tokens(&self, text: &str, _model: &str) -> Result<u32, ProviderError> {
        Ok(ModelCatalog::estimate_tokens(text))
    }

    async fn estimate_cost(
        &self,
        prompt: &str,
        model: &str,
        max_tokens: Option<u32>,
    ) -> Result<CostEstimate, ProviderError> {
        let input_tokens = ModelCatalog::estimate_tokens(prompt);

        if let Some(entry) = self.catalog.get(model) {
            if input_tokens > entry.context_window {
                return Err(ProviderError::TokenLimit {
                    tokens: input_tokens,
                    limit: entry.context_window,
                });
            }
        }

        let input_cost = self.catalog.compute_cost(model, input_tokens, 0);
        let output_cost = match max_tokens {
            Some(max) => self.catalog.compute_cost(model, 0, max),
            None => 0.0,
        };

        Ok(CostEstimate {
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            input_tokens,
        })
    }

    fn calculate_cost(&self, input_tokens: u32, output_tokens: u32, model: &str) -> f64 {
        self.catalog.compute_cost(model, input_tokens, output_tokens)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(self.catalog.models())
    }
}

// --- Anthropic API types (internal) ---

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_is_split_out() {
        let messages = vec![
            Message::system("be terse"),
            Message::system("be kind"),
            Message::user("hello"),
        ];
        let (system, api) = AnthropicProvider::split_messages(&messages);
        assert_eq!(system.as_deref(), Some("be terse\n\nbe kind"));
        assert_eq!(api.len(), 1);
        assert_eq!(api[0]["role"], "user");
    }

    #[test]
    fn no_system_prompt() {
        let (system, api) = AnthropicProvider::split_messages(&[Message::user("hi")]);
        assert!(system.is_none());
        assert_eq!(api.len(), 1);
    }

    #[test]
    fn parse_messages_response() {
        let data = r#"{
            "id": "msg_123",
            "model": "claude-sonnet-4",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "text", "text": " world"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert_eq!(parsed.usage.input_tokens, 10);
        assert_eq!(parsed.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn error_status_mapping() {
        let err = AnthropicProvider::map_error_status(429, "claude-sonnet-4", String::new());
        assert!(matches!(err, ProviderError::RateLimited { .. }));

        let err = AnthropicProvider::map_error_status(404, "claude-9", String::new());
        assert!(matches!(err, ProviderError::ModelNotFound(m) if m == "claude-9"));
    }

    #[tokio::test]
    async fn cost_estimate_uses_anthropic_pricing() {
        let p = AnthropicProvider::new("sk-ant-test").unwrap();
        // claude-3.5-haiku: $0.80/M input
        let estimate = p
            .estimate_cost(&"x".repeat(4000), "claude-3.5-haiku", None)
            .await
            .unwrap();
        assert_eq!(estimate.input_tokens, 1000);
        assert!((estimate.input_cost - 1000.0 * 0.8 / 1e6).abs() < 1e-12);
        assert_eq!(estimate.output_cost, 0.0);
    }

    #[test]
    fn base_url_trimmed() {
        let p = AnthropicProvider::new("k")
            .unwrap()
            .with_base_url("http://localhost:9999/");
        assert_eq!(p.base_url, "http://localhost:9999");
    }
}
