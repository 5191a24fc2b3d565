use std::sync::{Mutex, PoisonError};

use ledger_core::AlertTransition;
use tracing::warn;

/// Delivery seam for threshold crossings. The evaluator guarantees each
/// (rule, period, fraction) arrives here at most once.
pub trait Notifier: Send + Sync {
    fn notify(&self, transition: &AlertTransition);
}

/// Default sink: a structured warning per crossing.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, transition: &AlertTransition) {
        warn!(
            rule = %transition.rule_id,
            fraction = %transition.fraction,
            spend = %transition.spend,
            limit = %transition.limit,
            period_start = %transition.period.start,
            "budget threshold crossed"
        );
    }
}

/// Collects transitions instead of delivering them. Used by tests and by
/// callers that batch their own delivery.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    transitions: Mutex<Vec<AlertTransition>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<AlertTransition> {
        let mut guard = self
            .transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, transition: &AlertTransition) {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transition.clone());
    }
}
