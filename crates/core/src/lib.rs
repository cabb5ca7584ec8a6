//! # costrail Core
//!
//! Domain types, traits, and error definitions for the costrail LLM
//! orchestration layer. This crate has **zero framework dependencies** — it
//! defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping providers and addons via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod addon;
pub mod error;
pub mod message;
pub mod provider;

// Re-export key types at crate root for ergonomics
pub use addon::{Addon, AddonContext, ErrorDisposition, PreRequestOutcome};
pub use error::{AddonError, BudgetExceeded, Error, ProviderError, Result};
pub use message::{Message, Role};
pub use provider::{ChatRequest, ChatResponse, CostEstimate, ModelInfo, Provider};
