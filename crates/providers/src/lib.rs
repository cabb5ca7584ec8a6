//! LLM provider implementations for costrail.
//!
//! All providers implement the `costrail_core::Provider` trait. Each one
//! carries a [`ModelCatalog`] so token estimation and pricing work without a
//! network round-trip — the budget gate depends on that.

pub mod anthropic;
pub mod catalog;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use catalog::{CatalogEntry, ModelCatalog};
pub use openai::OpenAiProvider;
