//! The addon pipeline runner.
//!
//! Executes registered addons in order for each lifecycle stage and
//! implements the two coordination rules the rest of the system relies on:
//!
//! - **Short-circuit**: the first `pre_request` hook to return
//!   `FinalResponse` ends the pre-request sweep; later addons never see the
//!   call. Prompt rewrites (`Continue`) do *not* short-circuit — they are
//!   threaded forward so later addons observe earlier rewrites.
//! - **Error isolation**: a hook failure is caught, logged, and recorded in
//!   `context.custom["addon_errors"]`; the remaining addons still run. One
//!   misbehaving addon must never abort the pipeline.

use costrail_core::addon::{Addon, AddonContext, ErrorDisposition, PreRequestOutcome};
use costrail_core::error::Error;
use costrail_core::provider::ChatResponse;
use std::sync::Arc;
use tracing::{debug, error};

/// Result of a full pre-request sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum PreRequestResult {
    /// An addon supplied the final content; addons after it never ran.
    Final(String),
    /// Proceed to the provider with the (possibly rewritten) prompt.
    Proceed { prompt: String, rewritten: bool },
}

/// Ordered pipeline of addons.
///
/// Registration order is execution order. The enabled flag of each addon is
/// re-checked on every hook invocation, never cached.
#[derive(Default)]
pub struct AddonManager {
    addons: Vec<Arc<dyn Addon>>,
}

impl AddonManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an addon at the end of the chain.
    pub fn add(&mut self, addon: Arc<dyn Addon>) {
        debug!(addon = addon.name(), "Registering addon");
        self.addons.push(addon);
    }

    /// Unregister an addon by name. Returns whether one was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.addons.len();
        self.addons.retain(|a| a.name() != name);
        self.addons.len() < before
    }

    /// Look up an addon by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Addon>> {
        self.addons.iter().find(|a| a.name() == name)
    }

    /// The registered addons, in execution order.
    pub fn addons(&self) -> &[Arc<dyn Addon>] {
        &self.addons
    }

    /// Remove all registered addons.
    pub fn clear(&mut self) {
        self.addons.clear();
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    /// Run every enabled addon's `pre_request` hook in order.
    ///
    /// Each hook sees the *current* prompt — rewrites from earlier addons
    /// are threaded forward, and `ctx.prompt` tracks the latest value. The
    /// first `FinalResponse` short-circuits the sweep.
    pub async fn execute_pre_request(
        &self,
        prompt: &str,
        ctx: &mut AddonContext,
    ) -> PreRequestResult {
        let mut current = prompt.to_string();
        let mut rewritten = false;

        for addon in &self.addons {
            if !addon.is_enabled() {
                continue;
            }

            match addon.pre_request(&current, ctx).await {
                Ok(PreRequestOutcome::Unchanged) => {}
                Ok(PreRequestOutcome::Continue(next)) => {
                    debug!(
                        addon = addon.name(),
                        from_len = current.len(),
                        to_len = next.len(),
                        "Addon rewrote prompt"
                    );
                    current = next;
                    ctx.prompt = current.clone();
                    rewritten = true;
                }
                Ok(PreRequestOutcome::FinalResponse(content)) => {
                    debug!(addon = addon.name(), "Addon supplied final response");
                    return PreRequestResult::Final(content);
                }
                Err(e) => {
                    error!(
                        addon = addon.name(),
                        hook = "pre_request",
                        error = %e,
                        "Addon hook failed"
                    );
                    ctx.record_addon_error(addon.name(), "pre_request", &e.to_string());
                }
            }
        }

        PreRequestResult::Proceed {
            prompt: current,
            rewritten,
        }
    }

    /// Run every enabled addon's `post_request` hook in order.
    ///
    /// No short-circuit: each addon receives the output of the previous one.
    /// On a hook failure the response that addon was given flows onward.
    pub async fn execute_post_request(
        &self,
        response: ChatResponse,
        ctx: &mut AddonContext,
    ) -> ChatResponse {
        let mut current = response;

        for addon in &self.addons {
            if !addon.is_enabled() {
                continue;
            }

            match addon.post_request(current.clone(), ctx).await {
                Ok(next) => current = next,
                Err(e) => {
                    error!(
                        addon = addon.name(),
                        hook = "post_request",
                        error = %e,
                        "Addon hook failed"
                    );
                    ctx.record_addon_error(addon.name(), "post_request", &e.to_string());
                }
            }
        }

        current
    }

    /// Consult every enabled addon about a failed request.
    ///
    /// The aggregate is the logical OR of the individual votes: if any addon
    /// votes retry, the pipeline reports retry. A failing hook counts as no
    /// vote and never stops the remaining addons from being consulted.
    pub async fn execute_on_error(&self, err: &Error, ctx: &mut AddonContext) -> bool {
        let mut should_retry = false;

        for addon in &self.addons {
            if !addon.is_enabled() {
                continue;
            }

            match addon.on_error(err, ctx).await {
                Ok(ErrorDisposition::Retry) => should_retry = true,
                Ok(ErrorDisposition::Propagate) => {}
                Err(e) => {
                    error!(
                        addon = addon.name(),
                        hook = "on_error",
                        error = %e,
                        "Addon hook failed"
                    );
                    ctx.record_addon_error(addon.name(), "on_error", &e.to_string());
                }
            }
        }

        should_retry
    }
}
