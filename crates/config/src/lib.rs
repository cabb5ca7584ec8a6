//! Configuration loading, validation, and management for costrail.
//!
//! Loads configuration from `costrail.toml` with environment variable
//! overrides. All violations are collected and reported together at load
//! time rather than one at a time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `costrail.toml`.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct CostrailConfig {
    /// Provider connection settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Session defaults
    #[serde(default)]
    pub session: SessionConfig,

    /// Addon parameter blocks
    #[serde(default)]
    pub addons: AddonsConfig,
}

/// Provider connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name: "openai" or "anthropic"
    #[serde(default = "default_provider")]
    pub name: String,

    /// API key (overridable via `COSTRAIL_API_KEY`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Custom base URL for OpenAI-compatible endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_provider() -> String {
    "openai".into()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider(),
            api_key: None,
            base_url: None,
        }
    }
}

/// Session defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Default model
    #[serde(default = "default_model")]
    pub model: String,

    /// Default sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Default max tokens per response (0 = provider default)
    #[serde(default)]
    pub max_tokens: u32,

    /// Budget ceiling in USD (absent = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_usd: Option<f64>,

    /// Budget enforcement mode: "optimistic" or "reserve"
    #[serde(default = "default_enforcement")]
    pub budget_enforcement: String,

    /// Maximum provider-call retries per request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Simulate requests without calling the API
    #[serde(default)]
    pub dry_run: bool,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_enforcement() -> String {
    "optimistic".into()
}
fn default_max_retries() -> u32 {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: 0,
            budget_usd: None,
            budget_enforcement: default_enforcement(),
            max_retries: default_max_retries(),
            dry_run: false,
        }
    }
}

/// Per-addon parameter blocks. An absent block means the addon is not
/// registered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddonsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimizer: Option<MinimizerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_size")]
    pub max_size: usize,

    /// Entry TTL in seconds (absent = no expiry)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

fn default_cache_size() -> usize {
    100
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_size(),
            ttl_seconds: Some(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinimizerConfig {
    #[serde(default = "default_max_newlines")]
    pub max_newlines: usize,

    #[serde(default = "default_true")]
    pub preserve_code_blocks: bool,

    #[serde(default)]
    pub aggressive: bool,
}

fn default_max_newlines() -> usize {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            max_newlines: default_max_newlines(),
            preserve_code_blocks: true,
            aggressive: false,
        }
    }
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl std::fmt::Debug for CostrailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostrailConfig")
            .field("provider", &self.provider)
            .field("session", &self.session)
            .field("addons", &self.addons)
            .finish()
    }
}

impl CostrailConfig {
    /// Load configuration from `costrail.toml` in the working directory,
    /// then apply environment variable overrides:
    /// - `COSTRAIL_API_KEY` (falls back to `OPENAI_API_KEY` / `ANTHROPIC_API_KEY`)
    /// - `COSTRAIL_MODEL`
    /// - `COSTRAIL_BUDGET_USD`
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(Path::new("costrail.toml"))?;

        if config.provider.api_key.is_none() {
            config.provider.api_key = std::env::var("COSTRAIL_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());
        }

        if let Ok(model) = std::env::var("COSTRAIL_MODEL") {
            config.session.model = model;
        }

        if let Ok(budget) = std::env::var("COSTRAIL_BUDGET_USD") {
            let parsed = budget.parse::<f64>().map_err(|_| {
                ConfigError::Invalid(vec![format!(
                    "COSTRAIL_BUDGET_USD is not a number: '{budget}'"
                )])
            })?;
            config.session.budget_usd = Some(parsed);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path. A missing file yields
    /// the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, collecting every violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !matches!(self.provider.name.as_str(), "openai" | "anthropic") {
            errors.push(format!(
                "provider.name must be 'openai' or 'anthropic', got '{}'",
                self.provider.name
            ));
        }

        if let Some(key) = &self.provider.api_key {
            if key.trim().is_empty() {
                errors.push("provider.api_key is empty".into());
            }
        }

        if !(0.0..=2.0).contains(&self.session.temperature) {
            errors.push(format!(
                "session.temperature must be within [0.0, 2.0], got {}",
                self.session.temperature
            ));
        }

        if let Some(budget) = self.session.budget_usd {
            if budget < 0.0 {
                errors.push(format!(
                    "session.budget_usd must be non-negative, got {budget}"
                ));
            }
        }

        if !matches!(
            self.session.budget_enforcement.as_str(),
            "optimistic" | "reserve"
        ) {
            errors.push(format!(
                "session.budget_enforcement must be 'optimistic' or 'reserve', got '{}'",
                self.session.budget_enforcement
            ));
        }

        if let Some(cache) = &self.addons.cache {
            if cache.max_size == 0 {
                errors.push("addons.cache.max_size must be at least 1".into());
            }
        }

        if let Some(minimizer) = &self.addons.minimizer {
            if minimizer.max_newlines == 0 {
                errors.push("addons.minimizer.max_newlines must be at least 1".into());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Whether an API key is available (from file or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Configuration validation failed:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}
