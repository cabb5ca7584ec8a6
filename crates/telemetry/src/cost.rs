//! Cost tracking and budget enforcement.
//!
//! The tracker keeps an append-only log of per-request costs, running totals
//! partitioned by model, and an optional spending ceiling. The budget gate is
//! a pre-flight check against an *estimate*: in [`BudgetEnforcement::Optimistic`]
//! mode several concurrent requests can each pass the check against the same
//! stale total before any of them records, so cumulative spend can overshoot
//! the ceiling. [`BudgetEnforcement::Reserve`] closes that window by holding
//! each passing estimate until the request settles or is released.

use crate::TelemetryError;
use chrono::{DateTime, Utc};
use costrail_core::BudgetExceeded;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Immutable record of the cost of a single request. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub request_id: String,
    pub model: String,
    pub cost_usd: f64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub timestamp: DateTime<Utc>,
}

/// How the budget gate coordinates with concurrent requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetEnforcement {
    /// Check against recorded totals only. Matches the reference behavior:
    /// concurrent requests may each pass the gate before any records, so the
    /// ceiling can be overshot by in-flight estimates.
    #[default]
    Optimistic,

    /// Check-and-reserve: a passing estimate is held against the budget
    /// until the request records its actual cost or is released. Concurrent
    /// requests cannot jointly overshoot.
    Reserve,
}

#[derive(Debug, Default)]
struct CostState {
    budget_usd: Option<f64>,
    total_cost: f64,
    records: Vec<CostRecord>,
    by_model: HashMap<String, f64>,
    /// Outstanding reservations by request id (Reserve mode only).
    reserved: HashMap<String, f64>,
}

/// Tracks spend across requests and enforces the budget ceiling.
///
/// Thread-safe via an internal mutex; safe to share across concurrent batch
/// items.
pub struct CostTracker {
    state: Mutex<CostState>,
}

impl CostTracker {
    /// Create a tracker with an optional budget ceiling (`None` = unlimited).
    pub fn new(budget_usd: Option<f64>) -> Self {
        Self {
            state: Mutex::new(CostState {
                budget_usd,
                ..Default::default()
            }),
        }
    }

    /// The configured budget ceiling.
    pub fn budget(&self) -> Option<f64> {
        self.state.lock().unwrap().budget_usd
    }

    /// Replace the budget ceiling. Negative values are rejected.
    pub fn set_budget(&self, budget_usd: Option<f64>) -> Result<(), TelemetryError> {
        if let Some(b) = budget_usd {
            if b < 0.0 {
                return Err(TelemetryError::NegativeBudget(b));
            }
        }
        self.state.lock().unwrap().budget_usd = budget_usd;
        Ok(())
    }

    /// Pre-flight budget gate.
    ///
    /// Returns `Ok(())` when no budget is configured. Otherwise fails iff
    /// `recorded_total + estimated_cost` strictly exceeds the ceiling —
    /// landing exactly on the budget is allowed. Advisory only: nothing is
    /// held, so the check offers no isolation between concurrent callers.
    pub fn check_budget_available(&self, estimated_cost: f64) -> Result<(), BudgetExceeded> {
        let state = self.state.lock().unwrap();
        let Some(budget) = state.budget_usd else {
            return Ok(());
        };

        let projected = state.total_cost + estimated_cost;
        if projected > budget {
            return Err(BudgetExceeded {
                budget,
                projected,
                current: state.total_cost,
                estimated: estimated_cost,
            });
        }
        Ok(())
    }

    /// Strict-mode gate: atomically check and hold the estimate.
    ///
    /// The projection includes all outstanding reservations, so two
    /// concurrent requests cannot both pass against a budget that only fits
    /// one. The hold is settled by [`record_cost`](Self::record_cost) with
    /// the same request id, or cancelled with [`release`](Self::release).
    pub fn reserve(&self, request_id: &str, estimated_cost: f64) -> Result<(), BudgetExceeded> {
        let mut state = self.state.lock().unwrap();
        let Some(budget) = state.budget_usd else {
            return Ok(());
        };

        let outstanding: f64 = state.reserved.values().sum();
        let projected = state.total_cost + outstanding + estimated_cost;
        if projected > budget {
            return Err(BudgetExceeded {
                budget,
                projected,
                current: state.total_cost + outstanding,
                estimated: estimated_cost,
            });
        }

        state.reserved.insert(request_id.to_string(), estimated_cost);
        Ok(())
    }

    /// Cancel an outstanding reservation (e.g. the provider call failed).
    /// Returns whether a reservation existed.
    pub fn release(&self, request_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .reserved
            .remove(request_id)
            .is_some()
    }

    /// Record the actual cost of a completed request.
    ///
    /// Appends an immutable record and bumps running totals unconditionally —
    /// the budget was validated at estimate time, and re-validating here
    /// would double-charge. Clears any reservation held for the request.
    pub fn record_cost(
        &self,
        cost: f64,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        request_id: Option<&str>,
    ) -> CostRecord {
        let mut state = self.state.lock().unwrap();

        let request_id = match request_id {
            Some(id) => id.to_string(),
            None => format!("req_{}", state.records.len() + 1),
        };
        state.reserved.remove(&request_id);

        let record = CostRecord {
            request_id,
            model: model.to_string(),
            cost_usd: cost,
            input_tokens,
            output_tokens,
            timestamp: Utc::now(),
        };

        state.records.push(record.clone());
        state.total_cost += cost;
        *state.by_model.entry(model.to_string()).or_insert(0.0) += cost;

        record
    }

    /// Total recorded cost across all requests.
    pub fn total_cost(&self) -> f64 {
        self.state.lock().unwrap().total_cost
    }

    /// Remaining budget, or `None` when unlimited. Never negative.
    pub fn remaining_budget(&self) -> Option<f64> {
        let state = self.state.lock().unwrap();
        state.budget_usd.map(|b| (b - state.total_cost).max(0.0))
    }

    /// Fraction of budget consumed, clamped to [0, 1]. `None` when no budget
    /// is set or the budget is zero.
    pub fn budget_usage(&self) -> Option<f64> {
        let state = self.state.lock().unwrap();
        match state.budget_usd {
            Some(b) if b > 0.0 => Some((state.total_cost / b).min(1.0)),
            _ => None,
        }
    }

    /// Number of recorded requests.
    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    /// Detailed breakdown of recorded costs.
    pub fn breakdown(&self) -> CostBreakdown {
        let state = self.state.lock().unwrap();
        let request_count = state.records.len();
        let average_per_request = if request_count > 0 {
            state.total_cost / request_count as f64
        } else {
            0.0
        };

        CostBreakdown {
            total_cost: state.total_cost,
            budget: state.budget_usd,
            remaining_budget: state
                .budget_usd
                .map(|b| (b - state.total_cost).max(0.0)),
            budget_usage: match state.budget_usd {
                Some(b) if b > 0.0 => Some((state.total_cost / b).min(1.0)),
                _ => None,
            },
            request_count,
            by_model: state.by_model.clone(),
            average_per_request,
            records: state.records.clone(),
        }
    }

    /// Min/max/mean/median over per-request costs.
    pub fn statistics(&self) -> CostStatistics {
        let state = self.state.lock().unwrap();
        summarize(state.records.iter().map(|r| r.cost_usd))
    }

    /// Clear all records and totals. The budget ceiling is preserved.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.records.clear();
        state.by_model.clear();
        state.reserved.clear();
        state.total_cost = 0.0;
    }
}

/// Snapshot of recorded spend, suitable for session export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub total_cost: f64,
    pub budget: Option<f64>,
    pub remaining_budget: Option<f64>,
    pub budget_usage: Option<f64>,
    pub request_count: usize,
    pub by_model: HashMap<String, f64>,
    pub average_per_request: f64,
    pub records: Vec<CostRecord>,
}

/// Statistical summary over per-request costs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

fn summarize(values: impl Iterator<Item = f64>) -> CostStatistics {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return CostStatistics {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            median: 0.0,
        };
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };

    CostStatistics {
        min: sorted[0],
        max: sorted[n - 1],
        mean: sorted.iter().sum::<f64>() / n as f64,
        median,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_is_exact_sum() {
        let tracker = CostTracker::new(None);
        let costs = [0.01, 0.002, 0.0375, 0.0004];
        for (i, c) in costs.iter().enumerate() {
            tracker.record_cost(*c, "gpt-4o-mini", 100, 50, Some(&format!("r{i}")));
        }
        let expected: f64 = costs.iter().sum();
        assert_eq!(tracker.total_cost(), expected);
        assert_eq!(tracker.record_count(), 4);
    }

    #[test]
    fn no_budget_is_unlimited() {
        let tracker = CostTracker::new(None);
        assert!(tracker.check_budget_available(1_000_000.0).is_ok());
        assert!(tracker.remaining_budget().is_none());
        assert!(tracker.budget_usage().is_none());
    }

    #[test]
    fn gate_rejects_strictly_over_budget() {
        let tracker = CostTracker::new(Some(0.10));
        tracker.record_cost(0.06, "m", 0, 0, None);

        // Landing exactly on the ceiling is allowed
        assert!(tracker.check_budget_available(0.04).is_ok());

        let err = tracker.check_budget_available(0.05).unwrap_err();
        assert!((err.budget - 0.10).abs() < 1e-12);
        assert!((err.projected - 0.11).abs() < 1e-12);
        assert!((err.current - 0.06).abs() < 1e-12);
        assert!((err.estimated - 0.05).abs() < 1e-12);
    }

    #[test]
    fn record_never_revalidates() {
        let tracker = CostTracker::new(Some(0.01));
        // Recording over budget succeeds — validation happened at estimate time.
        tracker.record_cost(0.05, "m", 10, 10, Some("r1"));
        assert!((tracker.total_cost() - 0.05).abs() < 1e-12);
        assert_eq!(tracker.remaining_budget(), Some(0.0));
    }

    #[test]
    fn reserve_blocks_concurrent_overshoot() {
        let tracker = CostTracker::new(Some(0.05));

        // Both would pass the optimistic gate against the same stale total…
        assert!(tracker.check_budget_available(0.04).is_ok());
        assert!(tracker.check_budget_available(0.04).is_ok());

        // …but only one reservation fits.
        assert!(tracker.reserve("a", 0.04).is_ok());
        assert!(tracker.reserve("b", 0.04).is_err());
    }

    #[test]
    fn release_frees_reservation() {
        let tracker = CostTracker::new(Some(0.05));
        tracker.reserve("a", 0.04).unwrap();
        assert!(tracker.reserve("b", 0.04).is_err());

        assert!(tracker.release("a"));
        assert!(!tracker.release("a"));
        assert!(tracker.reserve("b", 0.04).is_ok());
    }

    #[test]
    fn record_settles_reservation() {
        let tracker = CostTracker::new(Some(0.10));
        tracker.reserve("a", 0.04).unwrap();
        tracker.record_cost(0.03, "m", 10, 10, Some("a"));

        // The hold is gone; only the recorded 0.03 counts now.
        assert!(tracker.reserve("b", 0.07).is_ok());
    }

    #[test]
    fn by_model_breakdown() {
        let tracker = CostTracker::new(Some(1.0));
        tracker.record_cost(0.01, "gpt-4o-mini", 100, 50, None);
        tracker.record_cost(0.02, "gpt-4o-mini", 100, 50, None);
        tracker.record_cost(0.30, "claude-sonnet-4", 200, 100, None);

        let breakdown = tracker.breakdown();
        assert_eq!(breakdown.request_count, 3);
        assert!((breakdown.by_model["gpt-4o-mini"] - 0.03).abs() < 1e-12);
        assert!((breakdown.by_model["claude-sonnet-4"] - 0.30).abs() < 1e-12);
        assert!((breakdown.average_per_request - 0.11).abs() < 1e-12);
        assert!((breakdown.budget_usage.unwrap() - 0.33).abs() < 1e-12);
    }

    #[test]
    fn auto_generated_request_ids() {
        let tracker = CostTracker::new(None);
        let r1 = tracker.record_cost(0.01, "m", 0, 0, None);
        let r2 = tracker.record_cost(0.01, "m", 0, 0, None);
        assert_eq!(r1.request_id, "req_1");
        assert_eq!(r2.request_id, "req_2");
    }

    #[test]
    fn statistics_median() {
        let tracker = CostTracker::new(None);
        for c in [0.03, 0.01, 0.02] {
            tracker.record_cost(c, "m", 0, 0, None);
        }
        let stats = tracker.statistics();
        assert!((stats.min - 0.01).abs() < 1e-12);
        assert!((stats.max - 0.03).abs() < 1e-12);
        assert!((stats.median - 0.02).abs() < 1e-12);
        assert!((stats.mean - 0.02).abs() < 1e-12);

        // Even count: median is the midpoint of the middle pair
        tracker.record_cost(0.04, "m", 0, 0, None);
        let stats = tracker.statistics();
        assert!((stats.median - 0.025).abs() < 1e-12);
    }

    #[test]
    fn empty_statistics_are_zero() {
        let tracker = CostTracker::new(None);
        let stats = tracker.statistics();
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 0.0);
        assert_eq!(stats.mean, 0.0);
        assert_eq!(stats.median, 0.0);
    }

    #[test]
    fn reset_preserves_budget() {
        let tracker = CostTracker::new(Some(0.5));
        tracker.record_cost(0.2, "m", 10, 10, None);
        tracker.reset();

        assert_eq!(tracker.total_cost(), 0.0);
        assert_eq!(tracker.record_count(), 0);
        assert_eq!(tracker.budget(), Some(0.5));
    }

    #[test]
    fn negative_budget_rejected() {
        let tracker = CostTracker::new(None);
        assert!(tracker.set_budget(Some(-1.0)).is_err());
        assert!(tracker.set_budget(Some(2.0)).is_ok());
        assert_eq!(tracker.budget(), Some(2.0));
    }
}
