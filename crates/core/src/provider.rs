//! Provider trait — the abstraction over LLM backends.
//!
//! A Provider knows how to send a conversation to an LLM API and report
//! what it cost: every implementation carries its own token estimation and
//! pricing so the orchestration layer can gate requests against a budget
//! before any bytes hit the wire.
//!
//! Implementations: OpenAI-compatible, Anthropic, mocks in tests.

use crate::error::ProviderError;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Configuration for a provider chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The model to use (e.g., "gpt-4o-mini", "claude-sonnet-4")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, higher = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

pub(crate) fn default_temperature() -> f32 {
    0.7
}

impl ChatRequest {
    /// Build a request from an optional system message and a user prompt.
    pub fn new(model: impl Into<String>, system: Option<&str>, prompt: &str) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A complete response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The generated text
    pub content: String,

    /// Which model actually responded (may differ from requested)
    pub model: String,

    /// Input tokens consumed
    pub input_tokens: u32,

    /// Output tokens generated
    pub output_tokens: u32,

    /// Why generation stopped ("stop", "length", ...), when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    /// Provider-specific metadata (raw response fragments, request ids)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChatResponse {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A pre-flight cost estimate for a request that has not been sent yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Estimated cost of the input tokens in USD
    pub input_cost: f64,

    /// Estimated cost of the output tokens in USD (zero when unbounded)
    pub output_cost: f64,

    /// Total estimated cost in USD
    pub total_cost: f64,

    /// Estimated input token count
    pub input_tokens: u32,
}

/// Metadata for a model a provider can serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier
    pub name: String,

    /// Maximum context window in tokens
    pub context_window: u32,

    /// Price per 1M input tokens in USD
    pub input_price_per_m: f64,

    /// Price per 1M output tokens in USD
    pub output_price_per_m: f64,
}

/// The core Provider trait.
///
/// Every LLM backend implements this. The session orchestrator calls it
/// without knowing which provider is behind it — pure polymorphism.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai", "anthropic").
    fn name(&self) -> &str;

    /// Check that the API key is valid and the provider is reachable.
    async fn validate_connection(&self) -> std::result::Result<bool, ProviderError>;

    /// Send a chat request and get a complete response.
    async fn chat(&self, request: ChatRequest)
    -> std::result::Result<ChatResponse, ProviderError>;

    /// Count (or estimate) the tokens in a text for a model.
    async fn count_tokens(
        &self,
        text: &str,
        model: &str,
    ) -> std::result::Result<u32, ProviderError>;

    /// Estimate the cost of a request before sending it.
    async fn estimate_cost(
        &self,
        prompt: &str,
        model: &str,
        max_tokens: Option<u32>,
    ) -> std::result::Result<CostEstimate, ProviderError>;

    /// Compute the actual cost of a completed request.
    ///
    /// Pure function of token counts. Returns 0.0 for unknown models rather
    /// than failing — an unpriced call must never poison a finished request.
    fn calculate_cost(&self, input_tokens: u32, output_tokens: u32, model: &str) -> f64;

    /// List models this provider can serve.
    ///
    /// Default implementation returns an empty list.
    async fn list_models(&self) -> std::result::Result<Vec<ModelInfo>, ProviderError> {
        Ok(Vec::new())
    }
}
