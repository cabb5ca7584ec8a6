//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI and any endpoint exposing a compatible
//! `/v1/chat/completions` surface (OpenRouter, vLLM, Ollama, Together AI).

use crate::catalog::ModelCatalog;
use async_trait::async_trait;
use costrail_core::error::ProviderError;
use costrail_core::message::{Message, Role};
use costrail_core::provider::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// An OpenAI-compatible LLM provider.
pub struct OpenAiProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    catalog: ModelCatalog,
}

impl OpenAiProvider {
    /// Create a provider against the official OpenAI endpoint.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_base_url("openai", DEFAULT_BASE_URL, api_key)
    }

    /// Create a provider against any OpenAI-compatible endpoint.
    pub fn with_base_url(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            catalog: ModelCatalog::openai_defaults(),
        })
    }

    /// Replace the built-in model catalog (custom deployments, private models).
    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::System => "system".into(),
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                },
                content: m.content.clone(),
            })
            .collect()
    }

    fn map_error_status(status: u16, model: &str, body: String) -> ProviderError {
        match status {
            429 => ProviderError::RateLimited { retry_after_secs: 5 },
            401 | 403 => ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ),
            404 => ProviderError::ModelNotFound(model.to_string()),
            _ => ProviderError::Api {
                status_code: status,
                message: body,
            },
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate_connection(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        debug!(provider = %self.name, model = %request.model, "Sending chat request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider returned error");
            return Err(Self::map_error_status(status, &request.model, error_body));
        }

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::Api {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Api {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        let usage = api_response.usage.unwrap_or_default();

        Ok(ChatResponse {
            content: choice.message.content,
            model: api_response.model,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            finish_reason: choice.finish_reason,
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

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
