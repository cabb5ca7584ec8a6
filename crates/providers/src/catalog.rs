//! Built-in model catalog: context windows and per-million-token pricing.
//!
//! Prices are USD per 1 million tokens. The catalog backs every provider's
//! `count_tokens` / `estimate_cost` / `calculate_cost` so the budget gate can
//! price a request without touching the network. Token counts are estimated
//! at roughly 4 characters per token — close enough for pre-flight gating,
//! and actual usage from the provider response is what gets recorded.

use costrail_core::provider::ModelInfo;
use std::collections::HashMap;
use std::sync::RwLock;

/// Context window and pricing for one model.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    /// Maximum context window in tokens.
    pub context_window: u32,
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
}

impl CatalogEntry {
    pub fn new(context_window: u32, input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            context_window,
            input_per_m,
            output_per_m,
        }
    }

    /// Compute cost for the given token counts.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_m + output_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

/// Thread-safe model catalog with built-in defaults and runtime overrides.
pub struct ModelCatalog {
    entries: RwLock<HashMap<String, CatalogEntry>>,
}

impl ModelCatalog {
    /// Catalog of the OpenAI models costrail prices out of the box.
    pub fn openai_defaults() -> Self {
        let mut entries = HashMap::new();
        entries.insert("gpt-4o".into(), CatalogEntry::new(128_000, 2.5, 10.0));
        entries.insert("gpt-4o-mini".into(), CatalogEntry::new(128_000, 0.15, 0.6));
        entries.insert("gpt-4-turbo".into(), CatalogEntry::new(128_000, 10.0, 30.0));
        entries.insert("o1".into(), CatalogEntry::new(200_000, 15.0, 60.0));
        entries.insert("o1-mini".into(), CatalogEntry::new(128_000, 3.0, 12.0));
        entries.insert("o3-mini".into(), CatalogEntry::new(200_000, 1.1, 4.4));
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Catalog of the Anthropic models costrail prices out of the box.
    pub fn anthropic_defaults() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            "claude-sonnet-4".into(),
            CatalogEntry::new(200_000, 3.0, 15.0),
        );
        entries.insert(
            "claude-opus-4".into(),
            CatalogEntry::new(200_000, 15.0, 75.0),
        );
        entries.insert(
            "claude-3.5-sonnet".into(),
            CatalogEntry::new(200_000, 3.0, 15.0),
        );
        entries.insert(
            "claude-3.5-haiku".into(),
            CatalogEntry::new(200_000, 0.8, 4.0),
        );
        entries.insert(
            "claude-3-haiku".into(),
            CatalogEntry::new(200_000, 0.25, 1.25),
        );
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Create an empty catalog.
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up an entry. Tries an exact match first, then the longest
    /// catalog name that prefixes the queried model — API responses often
    /// carry a version suffix (`gpt-4o-mini-2024-07-18` matches
    /// `gpt-4o-mini`).
    pub fn get(&self, model: &str) -> Option<CatalogEntry> {
        let entries = self.entries.read().unwrap();

        if let Some(entry) = entries.get(model) {
            return Some(*entry);
        }

        let model_lower = model.to_lowercase();
        entries
            .iter()
            .filter(|(name, _)| model_lower.starts_with(&name.to_lowercase()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, entry)| *entry)
    }

    /// Add or override an entry.
    pub fn set(&self, model: impl Into<String>, entry: CatalogEntry) {
        self.entries.write().unwrap().insert(model.into(), entry);
    }

    /// Compute cost for a model call. Unknown models cost 0.0 — a missing
    /// price must never fail a completed request.
    pub fn compute_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        match self.get(model) {
            Some(entry) => entry.cost(input_tokens, output_tokens),
            None => 0.0,
        }
    }

    /// Estimate tokens for a text: roughly 4 characters per token, at least
    /// one for non-empty text.
    pub fn estimate_tokens(text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        ((text.len() + 3) / 4) as u32
    }

    /// All catalog entries as `ModelInfo`, sorted by name.
    pub fn models(&self) -> Vec<ModelInfo> {
        let entries = self.entries.read().unwrap();
        let mut models: Vec<ModelInfo> = entries
            .iter()
            .map(|(name, entry)| ModelInfo {
                name: name.clone(),
                context_window: entry.context_window,
                input_price_per_m: entry.input_per_m,
                output_price_per_m: entry.output_per_m,
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_cost() {
        let catalog = ModelCatalog::anthropic_defaults();
        // claude-sonnet-4: $3/M input, $15/M output
        // (1000 * 3.0 + 500 * 15.0) / 1M = 0.0105
        let cost = catalog.compute_cost("claude-sonnet-4", 1000, 500);
        assert!((cost - 0.0105).abs() < 1e-10);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let catalog = ModelCatalog::openai_defaults();
        assert_eq!(catalog.compute_cost("mystery-model-9000", 1000, 500), 0.0);
    }

    #[test]
    fn version_suffix_prefix_match() {
        let catalog = ModelCatalog::openai_defaults();
        let direct = catalog.compute_cost("gpt-4o-mini", 1_000_000, 0);
        let suffixed = catalog.compute_cost("gpt-4o-mini-2024-07-18", 1_000_000, 0);
        assert!((direct - 0.15).abs() < 1e-10);
        assert_eq!(direct, suffixed);
    }

    #[test]
    fn longest_prefix_wins() {
        let catalog = ModelCatalog::openai_defaults();
        // "gpt-4o-mini-..." must match gpt-4o-mini, not the shorter gpt-4o
        let entry = catalog.get("gpt-4o-mini-2024-07-18").unwrap();
        assert!((entry.input_per_m - 0.15).abs() < 1e-10);
    }

    #[test]
    fn runtime_override() {
        let catalog = ModelCatalog::empty();
        assert!(catalog.is_empty());

        catalog.set("custom-model", CatalogEntry::new(8192, 1.0, 2.0));
        assert_eq!(catalog.len(), 1);

        let cost = catalog.compute_cost("custom-model", 1_000_000, 1_000_000);
        assert!((cost - 3.0).abs() < 1e-10);
    }

    #[test]
    fn token_estimation() {
        assert_eq!(ModelCatalog::estimate_tokens(""), 0);
        assert_eq!(ModelCatalog::estimate_tokens("abc"), 1);
        assert_eq!(ModelCatalog::estimate_tokens("abcd"), 1);
        assert_eq!(ModelCatalog::estimate_tokens("abcde"), 2);
        assert_eq!(ModelCatalog::estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn models_are_sorted() {
        let catalog = ModelCatalog::openai_defaults();
        let models = catalog.models();
        assert!(models.len() >= 6);
        assert!(models.windows(2).all(|w| w[0].name <= w[1].name));
        assert!(models.iter().any(|m| m.name == "gpt-4o"));
    }
}
