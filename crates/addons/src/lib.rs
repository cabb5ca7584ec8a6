//! Middleware pipeline for costrail chat requests.
//!
//! The [`AddonManager`] runs an ordered chain of [`Addon`]s around every
//! chat call: pre-request hooks that may rewrite the prompt or answer it
//! outright, post-request hooks that transform or validate the response, and
//! on-error hooks that vote on retries. A misbehaving addon is isolated —
//! its failure is logged into the request context and the chain keeps going.
//!
//! Registration order is execution order and it matters: the whitespace
//! minimizer must run before the cache so cache keys reflect the minimized
//! prompt.
//!
//! [`Addon`]: costrail_core::Addon

pub mod cache;
pub mod dry_run;
pub mod manager;
pub mod minimizer;
pub mod retry;
pub mod validator;

pub use cache::{CacheAddon, CacheStats};
pub use dry_run::{DryRunAddon, DryRunStats, LoggedRequest};
pub use manager::{AddonManager, PreRequestResult};
pub use minimizer::{MinimizerStats, WhitespaceMinimizerAddon};
pub use retry::{RetryAddon, RetryStats};
pub use validator::{ResponseValidatorAddon, ValidationMode, ValidatorStats};
