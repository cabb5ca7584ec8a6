//! The session orchestrator.
//!
//! One [`Session`] owns a provider, an addon pipeline, and the budget
//! engine. Every `chat` call walks the same state machine:
//!
//! ```text
//! pre-hooks ──► Final? ──────────────────────────┐
//!     │                                          │
//!     ▼ Proceed (possibly rewritten prompt)      │
//! dry-run? ──► synthesize ──────────────────────►│
//!     │                                          │
//!     ▼                                          ▼
//! budget gate ──► provider attempts[0..=max] ─► metrics once ─► alerts
//!                                                │
//!                                                ▼
//!                                     post-hooks ─► response
//! ```
//!
//! Budget violations are offered to the on-error pipeline for observation
//! and then always propagate — they are never retried. Provider errors are
//! retried only when the pipeline votes for it and attempts remain.

use chrono::{DateTime, Utc};
use costrail_addons::{
    AddonManager, CacheAddon, PreRequestResult, RetryAddon, WhitespaceMinimizerAddon,
};
use costrail_config::CostrailConfig;
use costrail_core::addon::{Addon, AddonContext, keys};
use costrail_core::error::{Error, Result};
use costrail_core::provider::{ChatRequest, Provider};
use costrail_telemetry::{
    AlertManager, BudgetEnforcement, CostTracker, TelemetryError, TokenMonitor,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Options for a single chat call.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Sampling temperature.
    pub temperature: f32,

    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,

    /// Optional system message prepended to the conversation.
    pub system_message: Option<String>,

    /// Call-site metadata, merged over the session metadata.
    pub metadata: Map<String, Value>,

    /// Whether to run the pre-flight budget gate. Batch execution exposes
    /// this as `check_budget_per_item`.
    pub check_budget: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
            system_message: None,
            metadata: Map::new(),
            check_budget: true,
        }
    }
}

/// Options for batch execution.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum chat calls in flight at once.
    pub max_concurrent: usize,

    /// Run the budget gate for every item (on by default).
    pub check_budget_per_item: bool,

    /// Per-item chat options.
    pub chat: ChatOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            check_budget_per_item: true,
            chat: ChatOptions::default(),
        }
    }
}

/// Normalized response returned by [`Session::chat`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub cached: bool,
}

/// One element of a [`Session::batch_generate`] result, in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub prompt_index: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<SessionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An LLM session with budget tracking, middleware and monitoring.
pub struct Session {
    session_id: String,
    provider: Arc<dyn Provider>,
    model: String,
    metadata: Map<String, Value>,
    addons: AddonManager,
    cost_tracker: CostTracker,
    token_monitor: TokenMonitor,
    alert_manager: AlertManager,
    enforcement: BudgetEnforcement,
    max_retries: u32,
    dry_run: bool,
    default_temperature: f32,
    default_max_tokens: Option<u32>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
    connected: AtomicBool,
    request_count: AtomicU64,
}

impl Session {
    /// Build a session from a loaded configuration: session defaults plus
    /// the configured addon blocks, registered minimizer → cache → retry so
    /// cache keys reflect minimized prompts.
    pub fn from_config(provider: Arc<dyn Provider>, config: &CostrailConfig) -> Self {
        let mut session = Session::new(provider, config.session.model.clone())
            .with_max_retries(config.session.max_retries)
            .with_dry_run(config.session.dry_run)
            .with_temperature(config.session.temperature);

        if config.session.max_tokens > 0 {
            session.default_max_tokens = Some(config.session.max_tokens);
        }
        if let Some(budget) = config.session.budget_usd {
            session = session.with_budget(budget);
        }
        if config.session.budget_enforcement == "reserve" {
            session = session.with_enforcement(BudgetEnforcement::Reserve);
        }

        if let Some(cfg) = &config.addons.minimizer {
            let mut addon = WhitespaceMinimizerAddon::new().with_max_newlines(cfg.max_newlines);
            if cfg.aggressive {
                addon = addon.aggressive();
            }
            if !cfg.preserve_code_blocks {
                addon = addon.without_code_block_preservation();
            }
            session.add_addon(Arc::new(addon));
        }
        if let Some(cfg) = &config.addons.cache {
            session.add_addon(Arc::new(CacheAddon::new(cfg.max_size, cfg.ttl_seconds)));
        }
        if let Some(cfg) = &config.addons.retry {
            session.add_addon(Arc::new(
                RetryAddon::new(cfg.max_retries)
                    .with_initial_delay(std::time::Duration::from_millis(cfg.initial_delay_ms))
                    .with_max_delay(std::time::Duration::from_millis(cfg.max_delay_ms)),
            ));
        }

        session
    }

    /// Create a session over a provider and model, with no budget.
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            provider,
            model: model.into(),
            metadata: Map::new(),
            addons: AddonManager::new(),
            cost_tracker: CostTracker::new(None),
            token_monitor: TokenMonitor::new(),
            alert_manager: AlertManager::new(),
            enforcement: BudgetEnforcement::Optimistic,
            max_retries: 3,
            dry_run: false,
            default_temperature: 0.7,
            default_max_tokens: None,
            started_at: Mutex::new(None),
            ended_at: Mutex::new(None),
            connected: AtomicBool::new(false),
            request_count: AtomicU64::new(0),
        }
    }

    /// Set the spending ceiling in USD.
    pub fn with_budget(self, budget_usd: f64) -> Self {
        // A fresh tracker always accepts a non-negative budget; negative
        // values are clamped to zero rather than silently ignored.
        let _ = self.cost_tracker.set_budget(Some(budget_usd.max(0.0)));
        self
    }

    /// Choose how the budget gate coordinates with concurrent requests.
    pub fn with_enforcement(mut self, enforcement: BudgetEnforcement) -> Self {
        self.enforcement = enforcement;
        self
    }

    /// Bound the provider-call retry loop (default 3).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Simulate requests without calling the provider.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Default sampling temperature for `chat` (per-call options override it).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.default_temperature = temperature;
        self
    }

    /// Attach session-level metadata, threaded into every request context.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Register an addon at the end of the pipeline. Order matters: a
    /// prompt-rewriting addon must come before the cache for cache keys to
    /// reflect the rewrite.
    pub fn add_addon(&mut self, addon: Arc<dyn Addon>) {
        self.addons.add(addon);
    }

    /// Register a one-shot budget alert at `threshold` (fraction of budget).
    pub fn set_alert(
        &self,
        threshold: f64,
        callback: impl Fn(f64, f64) + Send + Sync + 'static,
    ) -> std::result::Result<(), TelemetryError> {
        self.alert_manager.add_alert(threshold, callback)
    }

    /// Re-arm every alert; each fires again the next time its threshold is
    /// crossed.
    pub fn reset_alerts(&self) {
        self.alert_manager.reset_alerts();
    }

    // ── Accessors ─────────────────────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Total recorded cost in USD.
    pub fn cost_usd(&self) -> f64 {
        self.cost_tracker.total_cost()
    }

    /// Total tokens recorded.
    pub fn tokens_used(&self) -> u64 {
        self.token_monitor.total_tokens()
    }

    /// Remaining budget, `None` when unlimited.
    pub fn budget_remaining(&self) -> Option<f64> {
        self.cost_tracker.remaining_budget()
    }

    /// Number of chat calls issued so far.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.started_at.lock().unwrap().is_some() && self.ended_at.lock().unwrap().is_none()
    }

    pub(crate) fn cost_tracker(&self) -> &CostTracker {
        &self.cost_tracker
    }

    pub(crate) fn token_monitor(&self) -> &TokenMonitor {
        &self.token_monitor
    }

    pub(crate) fn alert_manager(&self) -> &AlertManager {
        &self.alert_manager
    }

    pub(crate) fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub(crate) fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub(crate) fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub(crate) fn timestamps(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (
            *self.started_at.lock().unwrap(),
            *self.ended_at.lock().unwrap(),
        )
    }

    /// Session duration so far, or final duration once ended.
    pub fn duration_seconds(&self) -> Option<f64> {
        let started = (*self.started_at.lock().unwrap())?;
        let end = self.ended_at.lock().unwrap().unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Validate the provider connection and stamp the start time.
    /// Idempotent; `chat` calls it automatically.
    pub async fn start(&self) -> Result<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            match self.provider.validate_connection().await {
                Ok(true) => {
                    info!(session_id = %self.session_id, provider = self.provider.name(), "Session started");
                }
                Ok(false) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(Error::Provider(
                        costrail_core::ProviderError::NotConfigured(format!(
                            "Provider '{}' failed connection validation",
                            self.provider.name()
                        )),
                    ));
                }
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
            }
        }

        let mut started = self.started_at.lock().unwrap();
        if started.is_none() {
            *started = Some(Utc::now());
        }
        Ok(())
    }

    /// Stamp the end time. Idempotent.
    pub fn end(&self) {
        let mut ended = self.ended_at.lock().unwrap();
        if ended.is_none() {
            *ended = Some(Utc::now());
        }
    }

    // ── Chat ──────────────────────────────────────────────────────────

    /// Send a chat request with the session's default options.
    pub async fn chat(&self, prompt: &str) -> Result<SessionResponse> {
        let options = ChatOptions {
            temperature: self.default_temperature,
            max_tokens: self.default_max_tokens,
            ..ChatOptions::default()
        };
        self.chat_with(prompt, options).await
    }

    /// Send a chat request.
    ///
    /// The returned future is the cancellation boundary: drop it or wrap it
    /// in `tokio::time::timeout` to impose a deadline. Backoff sleeps are
    /// ordinary awaits and cancel with it.
    pub async fn chat_with(&self, prompt: &str, options: ChatOptions) -> Result<SessionResponse> {
        self.start().await?;

        let seq = self.request_count.fetch_add(1, Ordering::SeqCst) + 1;
        let request_id = format!("{}_{}", self.session_id, seq);

        let mut ctx = AddonContext::new(&request_id, prompt, &self.model, self.provider.name());
        ctx.metadata = self.metadata.clone();
        for (k, v) in &options.metadata {
            ctx.metadata.insert(k.clone(), v.clone());
        }
        ctx.start_time = Some(Utc::now());

        match self.addons.execute_pre_request(prompt, &mut ctx).await {
            PreRequestResult::Final(content) => {
                self.finish_intercepted(content, &request_id, &mut ctx).await
            }
            PreRequestResult::Proceed { prompt: effective, .. } => {
                if self.dry_run {
                    self.finish_dry_run(&effective, &request_id, &options, &mut ctx)
                        .await
                } else {
                    self.call_provider(&effective, &request_id, &options, &mut ctx)
                        .await
                }
            }
        }
    }

    /// An addon supplied the final content: no provider call, no budget
    /// gate. Context flags say whether it was a cache hit or a dry-run
    /// interception; either way metrics are recorded exactly once.
    async fn finish_intercepted(
        &self,
        content: String,
        request_id: &str,
        ctx: &mut AddonContext,
    ) -> Result<SessionResponse> {
        let cached = ctx.flag(keys::CACHE_HIT);
        let dry_run = ctx.flag(keys::DRY_RUN);

        let (input_tokens, output_tokens, cost) = if dry_run {
            let input = ctx
                .custom
                .get("estimated_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            let output = ctx
                .custom
                .get("estimated_output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            let cost = self.provider.calculate_cost(input, output, &self.model);
            (input, output, cost)
        } else {
            // A cache hit or generic interception consumed nothing.
            (0, 0, 0.0)
        };

        self.token_monitor
            .record_usage(input_tokens, output_tokens, &self.model, Some(request_id));
        self.cost_tracker
            .record_cost(cost, &self.model, input_tokens, output_tokens, Some(request_id));
        self.check_alerts();

        ctx.response_content = Some(content.clone());
        ctx.end_time = Some(Utc::now());

        debug!(
            request_id,
            cached, dry_run, "Request intercepted by addon pipeline"
        );

        Ok(SessionResponse {
            content,
            model: self.model.clone(),
            input_tokens,
            output_tokens,
            cost_usd: cost,
            request_id: request_id.to_string(),
            finish_reason: None,
            dry_run,
            cached,
        })
    }

    /// Session-level dry run: price the request and synthesize a response
    /// without touching the provider.
    async fn finish_dry_run(
        &self,
        prompt: &str,
        request_id: &str,
        options: &ChatOptions,
        ctx: &mut AddonContext,
    ) -> Result<SessionResponse> {
        let input_tokens = self
            .provider
            .count_tokens(prompt, &self.model)
            .await
            .map_err(Error::Provider)?;
        let output_tokens = options.max_tokens.unwrap_or(100);
        let cost = self
            .provider
            .calculate_cost(input_tokens, output_tokens, &self.model);

        self.token_monitor
            .record_usage(input_tokens, output_tokens, &self.model, Some(request_id));
        self.cost_tracker
            .record_cost(cost, &self.model, input_tokens, output_tokens, Some(request_id));
        self.check_alerts();

        ctx.set_flag(keys::DRY_RUN, true);
        ctx.end_time = Some(Utc::now());

        Ok(SessionResponse {
            content: "[dry run] response would be generated here".into(),
            model: self.model.clone(),
            input_tokens,
            output_tokens,
            cost_usd: cost,
            request_id: request_id.to_string(),
            finish_reason: None,
            dry_run: true,
            cached: false,
        })
    }

    /// The real path: budget gate, bounded retry loop, metrics, post-hooks.
    async fn call_provider(
        &self,
        prompt: &str,
        request_id: &str,
        options: &ChatOptions,
        ctx: &mut AddonContext,
    ) -> Result<SessionResponse> {
        let reserved = if options.check_budget {
            self.gate_budget(prompt, request_id, options, ctx).await?
        } else {
            false
        };

        let mut request = ChatRequest::new(&self.model, options.system_message.as_deref(), prompt)
            .with_temperature(options.temperature);
        if let Some(max_tokens) = options.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let mut attempt: u32 = 0;
        let response = loop {
            match self.provider.chat(request.clone()).await {
                Ok(response) => break response,
                Err(provider_err) => {
                    let err = Error::Provider(provider_err);
                    ctx.error = Some(err.to_string());

                    let vote = self.addons.execute_on_error(&err, ctx).await;
                    if vote && attempt < self.max_retries {
                        // The retry addon tracks its own count in the
                        // context; keep it honest when no retry addon is
                        // registered and another addon voted.
                        let count = ctx.counter(keys::RETRY_COUNT).max((attempt + 1) as u64);
                        ctx.set_counter(keys::RETRY_COUNT, count);

                        let backoff = 2u64.saturating_pow(attempt);
                        warn!(
                            request_id,
                            attempt = attempt + 1,
                            backoff_secs = backoff,
                            "Provider call failed, retrying"
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                        attempt += 1;
                        continue;
                    }

                    if reserved {
                        self.cost_tracker.release(request_id);
                    }
                    return Err(err);
                }
            }
        };

        let cost = self.provider.calculate_cost(
            response.input_tokens,
            response.output_tokens,
            &self.model,
        );
        self.token_monitor.record_usage(
            response.input_tokens,
            response.output_tokens,
            &self.model,
            Some(request_id),
        );
        self.cost_tracker.record_cost(
            cost,
            &self.model,
            response.input_tokens,
            response.output_tokens,
            Some(request_id),
        );
        self.check_alerts();

        let (input_tokens, output_tokens) = (response.input_tokens, response.output_tokens);
        ctx.response_content = Some(response.content.clone());

        let response = self.addons.execute_post_request(response, ctx).await;
        ctx.end_time = Some(Utc::now());

        Ok(SessionResponse {
            content: response.content,
            model: response.model,
            input_tokens,
            output_tokens,
            cost_usd: cost,
            request_id: request_id.to_string(),
            finish_reason: response.finish_reason,
            dry_run: false,
            cached: false,
        })
    }

    /// Estimate the request cost and run the budget gate. Returns whether a
    /// reservation was taken. A violation is shown to the on-error pipeline
    /// for observation, then propagates — budget errors are never retried.
    async fn gate_budget(
        &self,
        prompt: &str,
        request_id: &str,
        options: &ChatOptions,
        ctx: &mut AddonContext,
    ) -> Result<bool> {
        let estimate = self
            .provider
            .estimate_cost(prompt, &self.model, options.max_tokens)
            .await
            .map_err(Error::Provider)?;

        let gate = match self.enforcement {
            BudgetEnforcement::Optimistic => self
                .cost_tracker
                .check_budget_available(estimate.total_cost)
                .map(|()| false),
            BudgetEnforcement::Reserve => self
                .cost_tracker
                .reserve(request_id, estimate.total_cost)
                .map(|()| self.cost_tracker.budget().is_some()),
        };

        match gate {
            Ok(reserved) => Ok(reserved),
            Err(budget_err) => {
                let err = Error::BudgetExceeded(budget_err);
                ctx.error = Some(err.to_string());
                let _ = self.addons.execute_on_error(&err, ctx).await;
                warn!(request_id, error = %err, "Budget gate rejected request");
                Err(err)
            }
        }
    }

    fn check_alerts(&self) {
        if let Some(budget) = self.cost_tracker.budget() {
            self.alert_manager
                .check_alerts(self.cost_tracker.total_cost(), budget);
        }
    }

    // ── Batch ─────────────────────────────────────────────────────────

    /// Run `chat` for every prompt under a concurrency bound.
    ///
    /// Results come back in input order. A failing item becomes a
    /// `success: false` entry with the error string — one bad prompt never
    /// aborts the batch.
    pub async fn batch_generate(
        &self,
        prompts: &[String],
        options: BatchOptions,
    ) -> Vec<BatchItem> {
        let semaphore = Arc::new(Semaphore::new(options.max_concurrent.max(1)));

        let tasks = prompts.iter().enumerate().map(|(index, prompt)| {
            let semaphore = Arc::clone(&semaphore);
            let mut chat_options = options.chat.clone();
            chat_options.check_budget = options.check_budget_per_item;

            async move {
                let _permit = semaphore.acquire().await.ok();
                match self.chat_with(prompt, chat_options).await {
                    Ok(response) => BatchItem {
                        prompt_index: index,
                        success: true,
                        response: Some(response),
                        error: None,
                    },
                    Err(e) => BatchItem {
                        prompt_index: index,
                        success: false,
                        response: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        });

        futures::future::join_all(tasks).await
    }
}
