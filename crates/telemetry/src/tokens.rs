//! Token usage monitoring.
//!
//! The token-side mirror of the cost tracker: running input/output totals
//! across requests, partitioned by model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Record of token usage for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub request_id: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub timestamp: DateTime<Utc>,
}

/// Per-model token totals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelTokens {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

#[derive(Debug, Default)]
struct TokenState {
    records: Vec<TokenUsage>,
    total_input: u64,
    total_output: u64,
    by_model: HashMap<String, ModelTokens>,
}

/// Monitors token consumption across requests. Thread-safe.
#[derive(Default)]
pub struct TokenMonitor {
    state: Mutex<TokenState>,
}

impl TokenMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record token usage for one request.
    pub fn record_usage(
        &self,
        input_tokens: u32,
        output_tokens: u32,
        model: &str,
        request_id: Option<&str>,
    ) -> TokenUsage {
        let mut state = self.state.lock().unwrap();

        let request_id = match request_id {
            Some(id) => id.to_string(),
            None => format!("req_{}", state.records.len() + 1),
        };

        let usage = TokenUsage {
            request_id,
            model: model.to_string(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            timestamp: Utc::now(),
        };

        state.records.push(usage.clone());
        state.total_input += input_tokens as u64;
        state.total_output += output_tokens as u64;

        let entry = state.by_model.entry(model.to_string()).or_default();
        entry.input += input_tokens as u64;
        entry.output += output_tokens as u64;
        entry.total += usage.total_tokens as u64;

        usage
    }

    /// Total tokens (input + output) across all requests.
    pub fn total_tokens(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.total_input + state.total_output
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.state.lock().unwrap().total_input
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.state.lock().unwrap().total_output
    }

    /// Detailed usage breakdown for export.
    pub fn breakdown(&self) -> UsageBreakdown {
        let state = self.state.lock().unwrap();
        let request_count = state.records.len();
        let total = state.total_input + state.total_output;
        UsageBreakdown {
            total_tokens: total,
            total_input_tokens: state.total_input,
            total_output_tokens: state.total_output,
            request_count,
            by_model: state.by_model.clone(),
            average_per_request: if request_count > 0 {
                total as f64 / request_count as f64
            } else {
                0.0
            },
            records: state.records.clone(),
        }
    }

    /// Min/max/mean/median over per-request total tokens.
    pub fn statistics(&self) -> TokenStatistics {
        let state = self.state.lock().unwrap();
        let mut sorted: Vec<u32> = state.records.iter().map(|r| r.total_tokens).collect();
        if sorted.is_empty() {
            return TokenStatistics {
                min: 0,
                max: 0,
                mean: 0.0,
                median: 0.0,
            };
        }
        sorted.sort_unstable();

        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2] as f64
        } else {
            (sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0
        };

        TokenStatistics {
            min: sorted[0],
            max: sorted[n - 1],
            mean: sorted.iter().map(|&t| t as u64).sum::<u64>() as f64 / n as f64,
            median,
        }
    }

    /// Clear all usage records and totals.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.records.clear();
        state.by_model.clear();
        state.total_input = 0;
        state.total_output = 0;
    }
}

/// Snapshot of recorded token usage, suitable for session export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageBreakdown {
    pub total_tokens: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub request_count: usize,
    pub by_model: HashMap<String, ModelTokens>,
    pub average_per_request: f64,
    pub records: Vec<TokenUsage>,
}

/// Statistical summary over per-request token totals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenStatistics {
    pub min: u32,
    pub max: u32,
    pub mean: f64,
    pub median: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate() {
        let monitor = TokenMonitor::new();
        monitor.record_usage(100, 50, "gpt-4o-mini", Some("r1"));
        monitor.record_usage(200, 75, "gpt-4o-mini", Some("r2"));

        assert_eq!(monitor.total_input_tokens(), 300);
        assert_eq!(monitor.total_output_tokens(), 125);
        assert_eq!(monitor.total_tokens(), 425);
    }

    #[test]
    fn by_model_partitioning() {
        let monitor = TokenMonitor::new();
        monitor.record_usage(100, 50, "gpt-4o-mini", None);
        monitor.record_usage(10, 5, "claude-sonnet-4", None);

        let breakdown = monitor.breakdown();
        assert_eq!(breakdown.by_model["gpt-4o-mini"].total, 150);
        assert_eq!(breakdown.by_model["claude-sonnet-4"].input, 10);
        assert_eq!(breakdown.request_count, 2);
        assert!((breakdown.average_per_request - 82.5).abs() < 1e-12);
    }

    #[test]
    fn statistics_over_requests() {
        let monitor = TokenMonitor::new();
        monitor.record_usage(10, 0, "m", None); // 10
        monitor.record_usage(20, 10, "m", None); // 30
        monitor.record_usage(15, 5, "m", None); // 20

        let stats = monitor.statistics();
        assert_eq!(stats.min, 10);
        assert_eq!(stats.max, 30);
        assert!((stats.mean - 20.0).abs() < 1e-12);
        assert!((stats.median - 20.0).abs() < 1e-12);
    }

    #[test]
    fn reset_clears_everything() {
        let monitor = TokenMonitor::new();
        monitor.record_usage(100, 50, "m", None);
        monitor.reset();

        assert_eq!(monitor.total_tokens(), 0);
        assert_eq!(monitor.breakdown().request_count, 0);
        assert!(monitor.breakdown().by_model.is_empty());
    }

    #[test]
    fn generated_ids_count_up() {
        let monitor = TokenMonitor::new();
        let u1 = monitor.record_usage(1, 1, "m", None);
        let u2 = monitor.record_usage(1, 1, "m", None);
        assert_eq!(u1.request_id, "req_1");
        assert_eq!(u2.request_id, "req_2");
    }
}
