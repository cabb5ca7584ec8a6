//! Retry addon — votes to retry transient provider failures.
//!
//! Backoff is exponential with ±20% jitter, capped at a configurable
//! maximum. The addon sleeps its own delay *before* voting retry, so by the
//! time the orchestrator re-issues the request the backoff has already been
//! served. The retry count lives in the request context
//! (`custom["retry_count"]`), not in the addon — the addon's own counters
//! are cross-request statistics.

use async_trait::async_trait;
use costrail_core::addon::{Addon, AddonContext, ErrorDisposition, keys};
use costrail_core::error::{AddonError, Error, ProviderError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Authorizes bounded retries of transient provider errors.
pub struct RetryAddon {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    exponential_base: f64,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
    enabled: AtomicBool,
}

impl Default for RetryAddon {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryAddon {
    /// Create a retry addon with default backoff (1s initial, 60s cap, base 2).
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            total_retries: AtomicU64::new(0),
            successful_retries: AtomicU64::new(0),
            failed_retries: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base.max(1.0);
        self
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Backoff for the given attempt: `initial * base^attempt`, capped at
    /// `max_delay`, with ±20% jitter against thundering herds.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.2 * (rand::thread_rng().r#gen::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }

    fn qualifies(err: &Error) -> Option<&ProviderError> {
        match err {
            Error::Provider(p) if p.is_transient() => Some(p),
            _ => None,
        }
    }

    /// Retry statistics since creation.
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            total_retries: self.total_retries.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            failed_retries: self.failed_retries.load(Ordering::Relaxed),
            max_retries: self.max_retries,
        }
    }

    pub fn reset_stats(&self) {
        self.total_retries.store(0, Ordering::Relaxed);
        self.successful_retries.store(0, Ordering::Relaxed);
        self.failed_retries.store(0, Ordering::Relaxed);
    }
}

fn reason(err: &ProviderError) -> &'static str {
    match err {
        ProviderError::RateLimited { .. } => "rate_limited",
        ProviderError::Timeout(_) => "timeout",
        ProviderError::Network(_) => "network",
        ProviderError::Api { .. } => "api_error",
        _ => "provider_error",
    }
}

#[async_trait]
impl Addon for RetryAddon {
    fn name(&self) -> &str {
        "retry"
    }

    fn description(&self) -> String {
        format!(
            "Retries transient failures (max {}, exponential backoff)",
            self.max_retries
        )
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    async fn on_error(
        &self,
        error: &Error,
        ctx: &mut AddonContext,
    ) -> Result<ErrorDisposition, AddonError> {
        let Some(provider_err) = Self::qualifies(error) else {
            return Ok(ErrorDisposition::Propagate);
        };

        let retry_count = ctx.counter(keys::RETRY_COUNT) as u32;
        if retry_count >= self.max_retries {
            self.failed_retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %ctx.request_id,
                retries = retry_count,
                "Retry budget exhausted"
            );
            return Ok(ErrorDisposition::Propagate);
        }

        let delay = self.backoff_delay(retry_count);

        ctx.set_counter(keys::RETRY_COUNT, (retry_count + 1) as u64);
        ctx.custom
            .insert("retry_delay_ms".into(), json!(delay.as_millis() as u64));
        ctx.custom
            .insert("retry_reason".into(), json!(reason(provider_err)));

        debug!(
            request_id = %ctx.request_id,
            attempt = retry_count + 1,
            delay_ms = delay.as_millis() as u64,
            reason = reason(provider_err),
            "Backing off before retry"
        );
        tokio::time::sleep(delay).await;

        self.total_retries.fetch_add(1, Ordering::Relaxed);
        Ok(ErrorDisposition::Retry)
    }

    async fn post_request(
        &self,
        response: costrail_core::provider::ChatResponse,
        ctx: &mut AddonContext,
    ) -> Result<costrail_core::provider::ChatResponse, AddonError> {
        // A success after at least one authorized retry counts as recovered
        if ctx.counter(keys::RETRY_COUNT) > 0 {
            self.successful_retries.fetch_add(1, Ordering::Relaxed);
        }
        Ok(response)
    }
}

/// Retry statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStats {
    pub total_retries: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub max_retries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn ctx() -> AddonContext {
        AddonContext::new("req-1", "hello", "gpt-4o-mini", "openai")
    }

    fn rate_limited() -> Error {
        Error::Provider(ProviderError::RateLimited { retry_after_secs: 1 })
    }

    #[tokio::test(start_paused = true)]
    async fn votes_retry_until_budget_exhausted() {
        let addon = RetryAddon::new(3).with_initial_delay(Duration::from_millis(10));
        let mut ctx = ctx();
        let err = rate_limited();

        // Four consecutive qualifying errors: three retries, then propagate
        for expected_count in 1..=3u64 {
            let vote = addon.on_error(&err, &mut ctx).await.unwrap();
            assert_eq!(vote, ErrorDisposition::Retry);
            assert_eq!(ctx.counter(keys::RETRY_COUNT), expected_count);
        }
        let vote = addon.on_error(&err, &mut ctx).await.unwrap();
        assert_eq!(vote, ErrorDisposition::Propagate);

        let stats = addon.stats();
        assert_eq!(stats.total_retries, 3);
        assert_eq!(stats.failed_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_never_retry() {
        let addon = RetryAddon::new(3);
        let mut ctx = ctx();

        for err in [
            Error::Provider(ProviderError::AuthenticationFailed("bad key".into())),
            Error::Provider(ProviderError::ModelNotFound("gpt-9".into())),
            Error::BudgetExceeded(costrail_core::BudgetExceeded {
                budget: 1.0,
                projected: 2.0,
                current: 1.5,
                estimated: 0.5,
            }),
        ] {
            let vote = addon.on_error(&err, &mut ctx).await.unwrap();
            assert_eq!(vote, ErrorDisposition::Propagate);
        }

        // No retry state was touched
        assert_eq!(ctx.counter(keys::RETRY_COUNT), 0);
        assert_eq!(addon.stats().total_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn records_delay_and_reason_in_context() {
        let addon = RetryAddon::new(3).with_initial_delay(Duration::from_millis(100));
        let mut ctx = ctx();

        addon.on_error(&rate_limited(), &mut ctx).await.unwrap();

        assert!(ctx.custom.get("retry_delay_ms").is_some());
        assert_eq!(
            ctx.custom.get("retry_reason").and_then(|v| v.as_str()),
            Some("rate_limited")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn successful_retry_is_counted_on_post() {
        let addon = RetryAddon::new(3).with_initial_delay(Duration::from_millis(1));
        let mut ctx = ctx();

        addon.on_error(&rate_limited(), &mut ctx).await.unwrap();

        let response = costrail_core::provider::ChatResponse {
            content: "ok".into(),
            model: "m".into(),
            input_tokens: 1,
            output_tokens: 1,
            finish_reason: None,
            metadata: Map::new(),
        };
        addon.post_request(response.clone(), &mut ctx).await.unwrap();
        assert_eq!(addon.stats().successful_retries, 1);

        // A clean first-try success does not count as a recovered retry
        let mut fresh = ctx;
        fresh.custom.remove(keys::RETRY_COUNT);
        addon.post_request(response, &mut fresh).await.unwrap();
        assert_eq!(addon.stats().successful_retries, 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let addon = RetryAddon::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(8))
            .with_exponential_base(2.0);

        // Jitter is ±20%, so compare against generous bounds
        let d0 = addon.backoff_delay(0).as_secs_f64();
        assert!((0.8..=1.2).contains(&d0), "d0 = {d0}");

        let d2 = addon.backoff_delay(2).as_secs_f64();
        assert!((3.2..=4.8).contains(&d2), "d2 = {d2}");

        // 2^5 = 32s would exceed the 8s cap
        let d5 = addon.backoff_delay(5).as_secs_f64();
        assert!(d5 <= 9.6, "d5 = {d5}");
    }

    #[test]
    fn stats_reset() {
        let addon = RetryAddon::new(2);
        addon.total_retries.store(5, Ordering::Relaxed);
        addon.reset_stats();
        assert_eq!(addon.stats().total_retries, 0);
    }
}
