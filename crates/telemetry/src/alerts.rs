//! One-shot budget alerts.
//!
//! An alert pairs a budget-consumption threshold with a callback. The first
//! time cumulative spend crosses the threshold the callback fires and the
//! alert flips to `triggered` permanently — it never re-fires for the same
//! session unless explicitly reset.

use crate::TelemetryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tracing::error;

/// Callback invoked with `(current_cost, budget)` when a threshold is crossed.
pub type AlertCallback = Arc<dyn Fn(f64, f64) + Send + Sync>;

struct Alert {
    threshold: f64,
    callback: AlertCallback,
    triggered: bool,
    trigger_time: Option<DateTime<Utc>>,
}

/// A threshold crossing reported by [`AlertManager::check_alerts`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredAlert {
    pub threshold: f64,
    pub trigger_time: DateTime<Utc>,
}

/// Exportable view of one registered alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStatus {
    pub threshold: f64,
    pub triggered: bool,
    pub trigger_time: Option<DateTime<Utc>>,
}

/// Manages budget alerts and triggers callbacks. Thread-safe.
#[derive(Default)]
pub struct AlertManager {
    alerts: Mutex<Vec<Alert>>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an alert at `threshold` (a fraction of budget in [0, 1]).
    ///
    /// Alerts are kept sorted by ascending threshold so a single sweep in
    /// `check_alerts` fires them in crossing order.
    pub fn add_alert(
        &self,
        threshold: f64,
        callback: impl Fn(f64, f64) + Send + Sync + 'static,
    ) -> Result<(), TelemetryError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(TelemetryError::ThresholdOutOfRange(threshold));
        }

        let mut alerts = self.alerts.lock().unwrap();
        alerts.push(Alert {
            threshold,
            callback: Arc::new(callback),
            triggered: false,
            trigger_time: None,
        });
        alerts.sort_by(|a, b| {
            a.threshold
                .partial_cmp(&b.threshold)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }

    /// Fire every not-yet-triggered alert whose threshold the current
    /// consumption has reached. Returns the newly triggered alerts.
    ///
    /// A zero or negative budget short-circuits to no alerts. A panicking
    /// callback is contained and logged; it does not stop later alerts from
    /// firing, and the alert still counts as triggered.
    pub fn check_alerts(&self, current_cost: f64, budget: f64) -> Vec<TriggeredAlert> {
        if budget <= 0.0 {
            return Vec::new();
        }

        let usage = current_cost / budget;
        let mut newly_triggered = Vec::new();

        // Collect callbacks under the lock, invoke them outside it so a slow
        // or reentrant callback cannot deadlock the manager.
        let to_fire: Vec<(f64, AlertCallback)> = {
            let mut alerts = self.alerts.lock().unwrap();
            let now = Utc::now();
            alerts
                .iter_mut()
                .filter(|a| !a.triggered && usage >= a.threshold)
                .map(|a| {
                    a.triggered = true;
                    a.trigger_time = Some(now);
                    newly_triggered.push(TriggeredAlert {
                        threshold: a.threshold,
                        trigger_time: now,
                    });
                    (a.threshold, Arc::clone(&a.callback))
                })
                .collect()
        };

        for (threshold, callback) in to_fire {
            if catch_unwind(AssertUnwindSafe(|| callback(current_cost, budget))).is_err() {
                error!(threshold, "Alert callback panicked");
            }
        }

        newly_triggered
    }

    /// Reset all alerts to the untriggered state.
    pub fn reset_alerts(&self) {
        let mut alerts = self.alerts.lock().unwrap();
        for alert in alerts.iter_mut() {
            alert.triggered = false;
            alert.trigger_time = None;
        }
    }

    /// Exportable status of every registered alert, ascending by threshold.
    pub fn status(&self) -> Vec<AlertStatus> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .map(|a| AlertStatus {
                threshold: a.threshold,
                triggered: a.triggered,
                trigger_time: a.trigger_time,
            })
            .collect()
    }

    /// Number of alerts that have fired.
    pub fn triggered_count(&self) -> usize {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.triggered)
            .count()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn threshold_out_of_range_rejected() {
        let manager = AlertManager::new();
        assert!(manager.add_alert(1.5, |_, _| {}).is_err());
        assert!(manager.add_alert(-0.1, |_, _| {}).is_err());
        assert!(manager.add_alert(0.0, |_, _| {}).is_ok());
        assert!(manager.add_alert(1.0, |_, _| {}).is_ok());
    }

    #[test]
    fn alerts_fire_once_in_ascending_order() {
        let manager = AlertManager::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for threshold in [0.8, 0.5] {
            let fired = Arc::clone(&fired);
            manager
                .add_alert(threshold, move |_, _| {
                    fired.lock().unwrap().push(threshold);
                })
                .unwrap();
        }

        // Crossing 0.5 fires only the 0.5 alert
        let triggered = manager.check_alerts(0.06, 0.10);
        assert_eq!(triggered.len(), 1);
        assert!((triggered[0].threshold - 0.5).abs() < 1e-12);

        // Re-checking the same level fires nothing
        assert!(manager.check_alerts(0.07, 0.10).is_empty());

        // Crossing 0.8 fires only the 0.8 alert
        let triggered = manager.check_alerts(0.09, 0.10);
        assert_eq!(triggered.len(), 1);
        assert!((triggered[0].threshold - 0.8).abs() < 1e-12);

        assert_eq!(*fired.lock().unwrap(), vec![0.5, 0.8]);
        assert_eq!(manager.triggered_count(), 2);
    }

    #[test]
    fn jump_fires_multiple_ascending() {
        let manager = AlertManager::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for threshold in [0.9, 0.25, 0.5] {
            let fired = Arc::clone(&fired);
            manager
                .add_alert(threshold, move |_, _| {
                    fired.lock().unwrap().push(threshold);
                })
                .unwrap();
        }

        let triggered = manager.check_alerts(1.0, 1.0);
        assert_eq!(triggered.len(), 3);
        assert_eq!(*fired.lock().unwrap(), vec![0.25, 0.5, 0.9]);
    }

    #[test]
    fn zero_budget_never_fires() {
        let manager = AlertManager::new();
        manager.add_alert(0.5, |_, _| panic!("must not fire")).unwrap();
        assert!(manager.check_alerts(100.0, 0.0).is_empty());
        assert!(manager.check_alerts(100.0, -1.0).is_empty());
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let manager = AlertManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        manager.add_alert(0.2, |_, _| panic!("boom")).unwrap();
        {
            let count = Arc::clone(&count);
            manager
                .add_alert(0.4, move |_, _| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        let triggered = manager.check_alerts(0.5, 1.0);
        assert_eq!(triggered.len(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // The panicking alert still counts as triggered — one-shot semantics hold
        assert_eq!(manager.triggered_count(), 2);
    }

    #[test]
    fn reset_allows_refiring() {
        let manager = AlertManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            manager
                .add_alert(0.5, move |_, _| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        manager.check_alerts(0.6, 1.0);
        manager.check_alerts(0.7, 1.0);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        manager.reset_alerts();
        manager.check_alerts(0.8, 1.0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_receives_cost_and_budget() {
        let manager = AlertManager::new();
        let seen = Arc::new(Mutex::new((0.0, 0.0)));
        {
            let seen = Arc::clone(&seen);
            manager
                .add_alert(0.5, move |cost, budget| {
                    *seen.lock().unwrap() = (cost, budget);
                })
                .unwrap();
        }

        manager.check_alerts(0.075, 0.10);
        let (cost, budget) = *seen.lock().unwrap();
        assert!((cost - 0.075).abs() < 1e-12);
        assert!((budget - 0.10).abs() < 1e-12);
    }

    #[test]
    fn status_view() {
        let manager = AlertManager::new();
        manager.add_alert(0.5, |_, _| {}).unwrap();
        manager.add_alert(0.8, |_, _| {}).unwrap();

        manager.check_alerts(0.6, 1.0);
        let status = manager.status();
        assert_eq!(status.len(), 2);
        assert!(status[0].triggered);
        assert!(status[0].trigger_time.is_some());
        assert!(!status[1].triggered);
    }
}
