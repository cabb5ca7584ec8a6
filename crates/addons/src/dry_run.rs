//! Dry-run addon — intercepts requests before they reach the provider.
//!
//! Every request is answered with a synthetic response and estimated token
//! counts, and optionally logged so callers can inspect what *would* have
//! been sent. Useful for testing pipelines and estimating costs without
//! spending anything.

use async_trait::async_trait;
use costrail_core::addon::{Addon, AddonContext, PreRequestOutcome, keys};
use costrail_core::error::AddonError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A request the dry-run addon intercepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedRequest {
    pub request_id: String,
    pub prompt: String,
    pub model: String,
    pub provider: String,
}

/// Simulates provider calls without making them.
pub struct DryRunAddon {
    mock_response: Option<String>,
    estimate_tokens: bool,
    log_requests: bool,
    mock_input_tokens: u32,
    mock_output_tokens: u32,
    request_log: Mutex<Vec<LoggedRequest>>,
    enabled: AtomicBool,
}

impl Default for DryRunAddon {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunAddon {
    pub fn new() -> Self {
        Self {
            mock_response: None,
            estimate_tokens: true,
            log_requests: true,
            mock_input_tokens: 10,
            mock_output_tokens: 50,
            request_log: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Use a fixed response body instead of the generated placeholder.
    pub fn with_mock_response(mut self, content: impl Into<String>) -> Self {
        self.mock_response = Some(content.into());
        self
    }

    /// Disable the chars/4 input estimation and use fixed token counts.
    pub fn with_fixed_tokens(mut self, input: u32, output: u32) -> Self {
        self.estimate_tokens = false;
        self.mock_input_tokens = input;
        self.mock_output_tokens = output;
        self
    }

    /// Stop recording intercepted requests.
    pub fn without_logging(mut self) -> Self {
        self.log_requests = false;
        self
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// The intercepted requests so far.
    pub fn request_log(&self) -> Vec<LoggedRequest> {
        self.request_log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.request_log.lock().unwrap().clear();
    }

    pub fn stats(&self) -> DryRunStats {
        DryRunStats {
            total_intercepted: self.request_log.lock().unwrap().len(),
            log_enabled: self.log_requests,
            estimate_tokens: self.estimate_tokens,
        }
    }

    fn mock_content(&self, prompt: &str, ctx: &AddonContext) -> String {
        if let Some(fixed) = &self.mock_response {
            return fixed.clone();
        }
        let preview: String = prompt.chars().take(50).collect();
        format!(
            "[dry-run] simulated response for '{preview}' (model {}, provider {})",
            ctx.model, ctx.provider
        )
    }
}

#[async_trait]
impl Addon for DryRunAddon {
    fn name(&self) -> &str {
        "dry_run"
    }

    fn description(&self) -> String {
        "Simulates API calls without making them".into()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    async fn pre_request(
        &self,
        prompt: &str,
        ctx: &mut AddonContext,
    ) -> Result<PreRequestOutcome, AddonError> {
        if self.log_requests {
            self.request_log.lock().unwrap().push(LoggedRequest {
                request_id: ctx.request_id.clone(),
                prompt: prompt.to_string(),
                model: ctx.model.clone(),
                provider: ctx.provider.clone(),
            });
        }

        let input_tokens = if self.estimate_tokens {
            (prompt.len() / 4) as u32
        } else {
            self.mock_input_tokens
        };
        ctx.custom
            .insert("estimated_input_tokens".into(), json!(input_tokens));
        ctx.custom
            .insert("estimated_output_tokens".into(), json!(self.mock_output_tokens));

        ctx.set_flag(keys::DRY_RUN, true);

        Ok(PreRequestOutcome::FinalResponse(
            self.mock_content(prompt, ctx),
        ))
    }
}

/// Dry-run statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunStats {
    pub total_intercepted: usize,
    pub log_enabled: bool,
    pub estimate_tokens: bool,
}
