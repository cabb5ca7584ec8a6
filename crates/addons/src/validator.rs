//! Response validator addon.
//!
//! Runs structural checks and an optional caller-supplied predicate against
//! every response. In `Strict` mode a failure surfaces as an addon error —
//! which the pipeline records in the request context without aborting the
//! call. In `Warn` mode it is logged and the response passes through.

use async_trait::async_trait;
use costrail_core::addon::{Addon, AddonContext};
use costrail_core::error::AddonError;
use costrail_core::provider::ChatResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

/// What to do when validation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Surface the failure as an addon error (recorded in the context).
    #[default]
    Strict,
    /// Log a warning and let the response pass.
    Warn,
}

type ValidatorFn = dyn Fn(&ChatResponse) -> Result<(), String> + Send + Sync;

/// Validates responses after each successful request.
pub struct ResponseValidatorAddon {
    mode: ValidationMode,
    require_non_empty: bool,
    min_content_length: Option<usize>,
    custom: Option<Box<ValidatorFn>>,
    successes: AtomicU64,
    failures: AtomicU64,
    enabled: AtomicBool,
}

impl ResponseValidatorAddon {
    pub fn new(mode: ValidationMode) -> Self {
        Self {
            mode,
            require_non_empty: true,
            min_content_length: None,
            custom: None,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Require at least `len` characters of content.
    pub fn with_min_content_length(mut self, len: usize) -> Self {
        self.min_content_length = Some(len);
        self
    }

    /// Allow empty content (on by default).
    pub fn allow_empty(mut self) -> Self {
        self.require_non_empty = false;
        self
    }

    /// Install a caller-supplied check. The returned string is the failure
    /// description.
    pub fn with_validator(
        mut self,
        f: impl Fn(&ChatResponse) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.custom = Some(Box::new(f));
        self
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    fn validate(&self, response: &ChatResponse) -> Vec<String> {
        let mut errors = Vec::new();

        if self.require_non_empty && response.content.trim().is_empty() {
            errors.push("response content is empty".to_string());
        }
        if let Some(min) = self.min_content_length {
            if response.content.len() < min {
                errors.push(format!(
                    "response content is {} chars, expected at least {min}",
                    response.content.len()
                ));
            }
        }
        if let Some(custom) = &self.custom {
            if let Err(msg) = custom(response) {
                errors.push(msg);
            }
        }

        errors
    }

    /// Validation statistics since creation.
    pub fn stats(&self) -> ValidatorStats {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let total = successes + failures;
        ValidatorStats {
            successes,
            failures,
            total,
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

#[async_trait]
impl Addon for ResponseValidatorAddon {
    fn name(&self) -> &str {
        "response_validator"
    }

    fn description(&self) -> String {
        format!("Validates responses (mode: {:?})", self.mode)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    async fn post_request(
        &self,
        response: ChatResponse,
        ctx: &mut AddonContext,
    ) -> Result<ChatResponse, AddonError> {
        let errors = self.validate(&response);

        if errors.is_empty() {
            self.successes.fetch_add(1, Ordering::Relaxed);
            return Ok(response);
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        let message = errors.join("; ");
        ctx.set_flag("validation_failed", true);
        ctx.custom
            .insert("validation_error".into(), json!(message));

        match self.mode {
            ValidationMode::Strict => Err(AddonError::new(self.name(), message)),
            ValidationMode::Warn => {
                warn!(
                    request_id = %ctx.request_id,
                    error = %message,
                    "Response validation failed"
                );
                Ok(response)
            }
        }
    }
}

/// Validation statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorStats {
    pub successes: u64,
    pub failures: u64,
    pub total: u64,
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn ctx() -> AddonContext {
        AddonContext::new("req-1", "hello", "gpt-4o-mini", "openai")
    }

    fn response(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            model: "gpt-4o-mini".into(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: Some("stop".into()),
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn valid_response_passes() {
        let addon = ResponseValidatorAddon::new(ValidationMode::Strict);
        let mut ctx = ctx();

        let out = addon.post_request(response("fine"), &mut ctx).await.unwrap();
        assert_eq!(out.content, "fine");
        assert_eq!(addon.stats().successes, 1);
        assert!(!ctx.flag("validation_failed"));
    }

    #[tokio::test]
    async fn strict_mode_surfaces_failure() {
        let addon = ResponseValidatorAddon::new(ValidationMode::Strict);
        let mut ctx = ctx();

        let err = addon.post_request(response("   "), &mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("empty"));
        assert!(ctx.flag("validation_failed"));
        assert_eq!(addon.stats().failures, 1);
    }

    #[tokio::test]
    async fn warn_mode_passes_failure_through() {
        let addon = ResponseValidatorAddon::new(ValidationMode::Warn);
        let mut ctx = ctx();

        let out = addon.post_request(response(""), &mut ctx).await.unwrap();
        assert_eq!(out.content, "");
        assert!(ctx.flag("validation_failed"));
        assert_eq!(addon.stats().failures, 1);
    }

    #[tokio::test]
    async fn min_length_check() {
        let addon = ResponseValidatorAddon::new(ValidationMode::Strict)
            .with_min_content_length(10);
        let mut ctx = ctx();

        assert!(addon.post_request(response("short"), &mut ctx).await.is_err());
        assert!(
            addon
                .post_request(response("long enough text"), &mut ctx)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn custom_validator_runs() {
        let addon = ResponseValidatorAddon::new(ValidationMode::Strict).with_validator(|r| {
            if r.content.contains("forbidden") {
                Err("contains forbidden phrase".into())
            } else {
                Ok(())
            }
        });
        let mut ctx = ctx();

        assert!(addon.post_request(response("all good"), &mut ctx).await.is_ok());
        let err = addon
            .post_request(response("a forbidden word"), &mut ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("forbidden phrase"));
    }

    #[tokio::test]
    async fn multiple_failures_joined() {
        let addon = ResponseValidatorAddon::new(ValidationMode::Strict)
            .with_min_content_length(5)
            .with_validator(|_| Err("always fails".into()));
        let mut ctx = ctx();

        let err = addon.post_request(response(""), &mut ctx).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("empty"));
        assert!(msg.contains("always fails"));
    }

    #[tokio::test]
    async fn stats_track_rate() {
        let addon = ResponseValidatorAddon::new(ValidationMode::Warn);
        let mut ctx = ctx();

        addon.post_request(response("ok"), &mut ctx).await.unwrap();
        addon.post_request(response("ok"), &mut ctx).await.unwrap();
        addon.post_request(response(""), &mut ctx).await.unwrap();

        let stats = addon.stats();
        assert_eq!(stats.total, 3);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-12);
    }
}
