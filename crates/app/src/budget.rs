use chrono::{DateTime, Utc};
use ledger_core::{AlertTransition, BudgetRule};
use ledger_db::{Db, EventFilter};
use tracing::debug;

use crate::error::Result;
use crate::notify::Notifier;

/// Evaluates budget rules against stored spend. Each evaluation fires at
/// most one transition per rule: the highest threshold now exceeded that
/// the persisted ratchet has not already covered. The ratchet only moves
/// up within a period; spend falling back below a threshold (possible for
/// rolling windows) does not re-arm it. A new period re-arms everything.
pub struct BudgetEvaluator {
    rules: Vec<BudgetRule>,
}

impl BudgetEvaluator {
    pub fn new(rules: Vec<BudgetRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[BudgetRule] {
        &self.rules
    }

    /// Evaluate every rule at `now`, persist ratchet movement, and hand
    /// each new crossing to the notifier.
    pub fn evaluate(
        &self,
        db: &Db,
        notifier: &dyn Notifier,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertTransition>> {
        let mut fired = Vec::new();
        for rule in &self.rules {
            if let Some(transition) = self.evaluate_rule(db, notifier, rule, now)? {
                fired.push(transition);
            }
        }
        Ok(fired)
    }

    fn evaluate_rule(
        &self,
        db: &Db,
        notifier: &dyn Notifier,
        rule: &BudgetRule,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertTransition>> {
        let range = rule.period.range_at(now);
        let state_key = rule.period.state_key(now);

        let filter = match rule.scope.provider() {
            Some(provider) => EventFilter::provider(provider),
            None => EventFilter::default(),
        };
        let spend = db.spend_summary(&range, &filter)?.cost;
        let reached = spend / rule.limit;

        let ratchet = db
            .alert_state(&rule.id)?
            .filter(|state| state.period_start == state_key)
            .and_then(|state| state.highest_fired);

        debug!(
            rule = %rule.id,
            spend = %spend,
            limit = %rule.limit,
            ratchet = ?ratchet,
            "budget evaluated"
        );

        // The highest threshold now exceeded that the ratchet has not
        // already covered. Jumping several thresholds at once fires only
        // the top one; the ratchet then suppresses the ones underneath.
        let crossed = rule
            .thresholds
            .iter()
            .filter(|fraction| reached >= **fraction)
            .filter(|fraction| ratchet.map_or(true, |floor| **fraction > floor))
            .max()
            .copied();

        let Some(fraction) = crossed else {
            return Ok(None);
        };
        let transition = AlertTransition {
            rule_id: rule.id.clone(),
            scope: rule.scope.clone(),
            fraction,
            period: range,
            spend,
            limit: rule.limit,
        };
        notifier.notify(&transition);
        db.record_alert(&rule.id, &state_key, fraction)?;
        Ok(Some(transition))
    }
}
