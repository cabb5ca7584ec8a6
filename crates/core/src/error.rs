//! Error types for the costrail domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all costrail operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Budget enforcement ---
    #[error("Budget error: {0}")]
    BudgetExceeded(#[from] BudgetExceeded),

    // --- Addon errors ---
    #[error("Addon error: {0}")]
    Addon(#[from] AddonError),

    // --- Response validation ---
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        errors: Vec<String>,
    },

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Errors raised by LLM provider clients.
///
/// `Clone` so retry logic and tests can script the same failure repeatedly.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Token limit exceeded: {tokens} tokens over limit of {limit}")]
    TokenLimit { tokens: u32, limit: u32 },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Whether this error is transient: a later identical request may succeed.
    ///
    /// Rate limits, timeouts, network drops and 5xx responses qualify;
    /// authentication, unknown-model and token-limit failures do not.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_)
            | ProviderError::Network(_) => true,
            ProviderError::Api { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

/// A request was denied because it would push spend over the configured ceiling.
///
/// Carries the full payload the budget gate computed: the ceiling, the
/// projected total had the request gone through, the total recorded so far
/// and the estimate that tipped it over.
#[derive(Debug, Clone, Error)]
#[error(
    "budget exceeded: projected ${projected:.4} over limit ${budget:.4} \
     (recorded ${current:.4} + estimated ${estimated:.4})"
)]
pub struct BudgetExceeded {
    pub budget: f64,
    pub projected: f64,
    pub current: f64,
    pub estimated: f64,
}

impl BudgetExceeded {
    /// Amount by which the projected spend exceeds the ceiling.
    pub fn overage(&self) -> f64 {
        self.projected - self.budget
    }
}

/// A failure inside an addon hook.
///
/// Always carries the offending addon's name. These never propagate out of
/// the pipeline — the manager catches them and records a diagnostic.
#[derive(Debug, Clone, Error)]
#[error("addon '{addon}' failed: {message}")]
pub struct AddonError {
    pub addon: String,
    pub message: String,
}

impl AddonError {
    pub fn new(addon: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            addon: addon.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::Api {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn budget_exceeded_carries_payload() {
        let err = BudgetExceeded {
            budget: 0.10,
            projected: 0.12,
            current: 0.08,
            estimated: 0.04,
        };
        assert!((err.overage() - 0.02).abs() < 1e-10);
        let msg = err.to_string();
        assert!(msg.contains("$0.1200"));
        assert!(msg.contains("$0.1000"));
    }

    #[test]
    fn transient_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: 5 }.is_transient());
        assert!(ProviderError::Network("conn reset".into()).is_transient());
        assert!(
            ProviderError::Api {
                status_code: 503,
                message: "overloaded".into()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Api {
                status_code: 400,
                message: "bad request".into()
            }
            .is_transient()
        );
        assert!(!ProviderError::ModelNotFound("gpt-9".into()).is_transient());
        assert!(!ProviderError::AuthenticationFailed("bad key".into()).is_transient());
    }

    #[test]
    fn addon_error_names_offender() {
        let err = AddonError::new("cache", "lock poisoned");
        assert!(err.to_string().contains("cache"));
        assert!(err.to_string().contains("lock poisoned"));
    }
}
