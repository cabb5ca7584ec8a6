//! Session orchestration for costrail.
//!
//! A [`Session`] ties the addon pipeline, the budget engine and a provider
//! together per logical chat call: it runs pre-request hooks, gates the
//! request against the spending ceiling, drives the bounded retry loop
//! around the provider call, records usage and cost exactly once, fires
//! budget alerts and runs post-request hooks. Batch execution fans chat
//! calls out under a concurrency bound, converting per-item failures into
//! structured results instead of aborting the batch.

pub mod export;
pub mod session;

pub use export::{EXPORT_SCHEMA_VERSION, SessionExport};
pub use session::{BatchItem, BatchOptions, ChatOptions, Session, SessionResponse};
