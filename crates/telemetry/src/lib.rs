//! Cost tracking, token monitoring, and budget enforcement for costrail.
//!
//! Running totals over every request a session makes, a pre-flight budget
//! gate that refuses requests projected to breach the spending ceiling, and
//! one-shot threshold alerts that fire as cumulative spend crosses fractions
//! of the budget.

pub mod alerts;
pub mod cost;
pub mod tokens;

pub use alerts::{AlertManager, AlertStatus, TriggeredAlert};
pub use cost::{BudgetEnforcement, CostBreakdown, CostRecord, CostStatistics, CostTracker};
pub use tokens::{TokenMonitor, TokenStatistics, TokenUsage, UsageBreakdown};

/// Errors from the telemetry subsystem.
///
/// Budget violations are not here — they are domain errors and live in
/// `costrail_core::BudgetExceeded`.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("budget must be non-negative, got {0}")]
    NegativeBudget(f64),

    #[error("alert threshold must be within [0.0, 1.0], got {0}")]
    ThresholdOutOfRange(f64),
}
