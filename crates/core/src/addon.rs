//! Addon trait — the middleware abstraction around every chat call.
//!
//! An addon hooks into up to three stages of a request's life:
//!
//! 1. `pre_request` — before the provider call. May rewrite the prompt
//!    (`Continue`), supply the final answer and skip the provider entirely
//!    (`FinalResponse`), or stay out of the way (`Unchanged`).
//! 2. `post_request` — after a successful call. May transform, validate or
//!    merely observe the response.
//! 3. `on_error` — after a failed call. Votes on whether the request should
//!    be retried.
//!
//! All hooks have no-op defaults, so an addon implements only the stages it
//! cares about. Addons communicate with each other and with the orchestrator
//! exclusively through [`AddonContext::custom`] — no addon may assume any
//! other specific addon ran.

use crate::error::{AddonError, Error};
use crate::provider::ChatResponse;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

/// Well-known context keys shared between the built-in addons and the
/// session orchestrator.
pub mod keys {
    /// Set by the cache addon: `true` on a hit, `false` on a miss.
    pub const CACHE_HIT: &str = "cache_hit";
    /// Set by the cache addon: the key the response is stored under.
    pub const CACHE_KEY: &str = "cache_key";
    /// Set by the dry-run addon when it intercepts a request.
    pub const DRY_RUN: &str = "dry_run";
    /// Number of retries authorized so far for this request.
    pub const RETRY_COUNT: &str = "retry_count";
    /// Diagnostics for hooks that failed; a list of {addon, hook, error}.
    pub const ADDON_ERRORS: &str = "addon_errors";
}

/// Per-request scratch record threaded through the pipeline.
///
/// Created at the start of one logical chat call, mutated by every hook and
/// by the orchestrator, discarded when the call returns.
#[derive(Debug, Clone)]
pub struct AddonContext {
    /// Unique, caller-visible request identifier.
    pub request_id: String,

    /// The prompt as it currently stands. Rewriting addons update this
    /// through the pipeline, so later addons see earlier rewrites.
    pub prompt: String,

    /// Model identifier — immutable for the context's life.
    pub model: String,

    /// Provider name — immutable for the context's life.
    pub provider: String,

    /// Merged session + call-site metadata.
    pub metadata: Map<String, Value>,

    /// When the request started.
    pub start_time: Option<DateTime<Utc>>,

    /// When the request completed.
    pub end_time: Option<DateTime<Utc>>,

    /// The last error seen for this request, if any.
    pub error: Option<String>,

    /// Content of the provider (or addon-supplied) reply, once known.
    pub response_content: Option<String>,

    /// Open key→value scratch space — the only side channel between addons.
    pub custom: Map<String, Value>,
}

impl AddonContext {
    /// Create a context for one logical request.
    pub fn new(
        request_id: impl Into<String>,
        prompt: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: prompt.into(),
            model: model.into(),
            provider: provider.into(),
            metadata: Map::new(),
            start_time: None,
            end_time: None,
            error: None,
            response_content: None,
            custom: Map::new(),
        }
    }

    /// Request duration, when both timestamps are set.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Read a boolean flag from the scratch space (absent = false).
    pub fn flag(&self, key: &str) -> bool {
        self.custom.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Set a boolean flag in the scratch space.
    pub fn set_flag(&mut self, key: &str, value: bool) {
        self.custom.insert(key.to_string(), Value::Bool(value));
    }

    /// Read an integer counter from the scratch space (absent = 0).
    pub fn counter(&self, key: &str) -> u64 {
        self.custom.get(key).and_then(Value::as_u64).unwrap_or(0)
    }

    /// Set an integer counter in the scratch space.
    pub fn set_counter(&mut self, key: &str, value: u64) {
        self.custom.insert(key.to_string(), json!(value));
    }

    /// Append a hook-failure diagnostic to `custom["addon_errors"]`,
    /// creating the list on first use.
    pub fn record_addon_error(&mut self, addon: &str, hook: &str, error: &str) {
        let entry = json!({ "addon": addon, "hook": hook, "error": error });
        match self.custom.get_mut(keys::ADDON_ERRORS) {
            Some(Value::Array(list)) => list.push(entry),
            _ => {
                self.custom
                    .insert(keys::ADDON_ERRORS.to_string(), Value::Array(vec![entry]));
            }
        }
    }

    /// The recorded hook-failure diagnostics, empty if none.
    pub fn addon_errors(&self) -> &[Value] {
        match self.custom.get(keys::ADDON_ERRORS) {
            Some(Value::Array(list)) => list,
            _ => &[],
        }
    }
}

/// What a `pre_request` hook decided.
///
/// This tagged union replaces the legacy convention of a nullable string
/// that could mean either "here is the final answer" or "here is a rewritten
/// prompt" — the caller no longer has to guess which one it got.
#[derive(Debug, Clone, PartialEq)]
pub enum PreRequestOutcome {
    /// Pass the current prompt through untouched.
    Unchanged,
    /// Continue to the provider with this rewritten prompt.
    Continue(String),
    /// Skip the provider call; this content is the final answer.
    FinalResponse(String),
}

/// An `on_error` hook's vote on what should happen to a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// The request should be retried.
    Retry,
    /// The error should propagate to the caller.
    Propagate,
}

/// A middleware unit hooking into the chat request lifecycle.
///
/// Addon instances live as long as the pipeline that holds them and carry
/// their own statistics across calls; anything mutable inside must be
/// interior-mutability-protected, since batch execution invokes hooks from
/// concurrent tasks.
#[async_trait]
pub trait Addon: Send + Sync {
    /// Unique addon name.
    fn name(&self) -> &str;

    /// One-line description of what this addon does.
    fn description(&self) -> String;

    /// Whether this addon is currently active. Re-checked on every hook
    /// invocation, never cached by the pipeline.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Hook called before the provider request.
    async fn pre_request(
        &self,
        _prompt: &str,
        _ctx: &mut AddonContext,
    ) -> std::result::Result<PreRequestOutcome, AddonError> {
        Ok(PreRequestOutcome::Unchanged)
    }

    /// Hook called after a successful provider request.
    async fn post_request(
        &self,
        response: ChatResponse,
        _ctx: &mut AddonContext,
    ) -> std::result::Result<ChatResponse, AddonError> {
        Ok(response)
    }

    /// Hook called when a request fails.
    async fn on_error(
        &self,
        _error: &Error,
        _ctx: &mut AddonContext,
    ) -> std::result::Result<ErrorDisposition, AddonError> {
        Ok(ErrorDisposition::Propagate)
    }
}
