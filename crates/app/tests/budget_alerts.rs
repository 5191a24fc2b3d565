use chrono::{DateTime, TimeZone, Utc};
use ledger_app::{BudgetEvaluator, RecordingNotifier};
use ledger_core::{
    BudgetPeriod, BudgetRule, BudgetScope, UsageEvent, UsageUnits, raw_fingerprint,
};
use ledger_db::{Db, SourceCheckpoint};
use rust_decimal::Decimal;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    db: Db,
}

fn setup() -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut db = Db::open(dir.path().join("ledger.sqlite")).expect("open db");
    db.migrate().expect("migrate db");
    Fixture { _dir: dir, db }
}

fn dec(value: &str) -> Decimal {
    value.parse().expect("decimal")
}

fn spend_event(id: &str, occurred_at: &str, provider: &str, cost: &str) -> UsageEvent {
    UsageEvent {
        id: id.to_string(),
        occurred_at: occurred_at.to_string(),
        occurred_at_inferred: false,
        provider: provider.to_string(),
        model: "gpt-4o".to_string(),
        units: UsageUnits {
            input_units: 1000,
            output_units: 500,
            cached_units: 0,
        },
        cost: Some(dec(cost)),
        pricing_version: Some(1),
        source: "/logs/a.jsonl".to_string(),
        epoch: 0,
        raw_fingerprint: raw_fingerprint(id),
        raw_json: None,
    }
}

fn checkpoint(offset: u64) -> SourceCheckpoint {
    SourceCheckpoint {
        source: "/logs/a.jsonl".to_string(),
        byte_offset: offset,
        epoch: 0,
        head_len: 0,
        head_hash: None,
        last_event_id: None,
        updated_at: "2025-01-01T00:00:00.000Z".to_string(),
    }
}

fn add_spend(db: &mut Db, id: &str, occurred_at: &str, cost: &str) {
    let events = vec![spend_event(id, occurred_at, "openai", cost)];
    db.append_batch(&events, &checkpoint(0)).expect("append");
}

fn daily_rule(limit: &str, thresholds: &[&str]) -> BudgetRule {
    BudgetRule {
        id: "daily".to_string(),
        scope: BudgetScope::Global,
        period: BudgetPeriod::Daily,
        limit: dec(limit),
        thresholds: thresholds.iter().map(|raw| dec(raw)).collect(),
    }
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 15, hour, minute, 0).unwrap()
}

#[test]
fn each_threshold_fires_once_per_period() {
    let mut fixture = setup();
    let evaluator = BudgetEvaluator::new(vec![daily_rule("10", &["0.8", "1.0"])]);
    let notifier = RecordingNotifier::default();

    // 85% of the limit: the 0.8 threshold fires, once.
    add_spend(&mut fixture.db, "s1", "2025-03-15T08:00:00.000Z", "8.5");
    evaluator
        .evaluate(&fixture.db, &notifier, at(9, 0))
        .expect("evaluate");
    let fired = notifier.take();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].fraction, dec("0.8"));
    assert_eq!(fired[0].spend, dec("8.5"));

    // Unchanged spend: nothing new fires.
    evaluator
        .evaluate(&fixture.db, &notifier, at(10, 0))
        .expect("evaluate");
    assert!(notifier.take().is_empty());

    // Over the limit: only the 1.0 threshold fires.
    add_spend(&mut fixture.db, "s2", "2025-03-15T11:00:00.000Z", "2");
    evaluator
        .evaluate(&fixture.db, &notifier, at(12, 0))
        .expect("evaluate");
    let fired = notifier.take();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].fraction, dec("1.0"));
}

#[test]
fn jump_over_several_thresholds_fires_only_the_highest() {
    let mut fixture = setup();
    let evaluator = BudgetEvaluator::new(vec![daily_rule("10", &["0.5", "0.8", "1.0"])]);
    let notifier = RecordingNotifier::default();

    add_spend(&mut fixture.db, "s1", "2025-03-15T08:00:00.000Z", "12");
    evaluator
        .evaluate(&fixture.db, &notifier, at(9, 0))
        .expect("evaluate");
    let fired = notifier.take();
    let fractions: Vec<Decimal> = fired.iter().map(|t| t.fraction).collect();
    assert_eq!(fractions, vec![dec("1.0")]);

    // The skipped thresholds stay covered by the ratchet afterwards.
    evaluator
        .evaluate(&fixture.db, &notifier, at(10, 0))
        .expect("evaluate");
    assert!(notifier.take().is_empty());
}

#[test]
fn ratchet_survives_evaluator_restart() {
    let mut fixture = setup();
    add_spend(&mut fixture.db, "s1", "2025-03-15T08:00:00.000Z", "8.5");

    let notifier = RecordingNotifier::default();
    BudgetEvaluator::new(vec![daily_rule("10", &["0.8", "1.0"])])
        .evaluate(&fixture.db, &notifier, at(9, 0))
        .expect("evaluate");
    assert_eq!(notifier.take().len(), 1);

    // A fresh evaluator over the same store sees the persisted ratchet.
    BudgetEvaluator::new(vec![daily_rule("10", &["0.8", "1.0"])])
        .evaluate(&fixture.db, &notifier, at(10, 0))
        .expect("evaluate");
    assert!(notifier.take().is_empty());
}

#[test]
fn new_period_rearms_thresholds() {
    let mut fixture = setup();
    let evaluator = BudgetEvaluator::new(vec![daily_rule("10", &["0.8"])]);
    let notifier = RecordingNotifier::default();

    add_spend(&mut fixture.db, "s1", "2025-03-15T08:00:00.000Z", "9");
    evaluator
        .evaluate(&fixture.db, &notifier, at(9, 0))
        .expect("evaluate");
    assert_eq!(notifier.take().len(), 1);

    // Next day, new spend crosses again and fires again.
    add_spend(&mut fixture.db, "s2", "2025-03-16T08:00:00.000Z", "9");
    let next_day = Utc.with_ymd_and_hms(2025, 3, 16, 9, 0, 0).unwrap();
    evaluator
        .evaluate(&fixture.db, &notifier, next_day)
        .expect("evaluate");
    let fired = notifier.take();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].period.start, "2025-03-16T00:00:00.000Z");
}

#[test]
fn window_spend_falling_back_does_not_rearm() {
    let mut fixture = setup();
    let rule = BudgetRule {
        id: "window".to_string(),
        scope: BudgetScope::Global,
        period: BudgetPeriod::Window { hours: 2 },
        limit: dec("10"),
        thresholds: vec![dec("0.8")],
    };
    let evaluator = BudgetEvaluator::new(vec![rule]);
    let notifier = RecordingNotifier::default();

    add_spend(&mut fixture.db, "s1", "2025-03-15T08:30:00.000Z", "9");
    evaluator
        .evaluate(&fixture.db, &notifier, at(9, 0))
        .expect("evaluate");
    assert_eq!(notifier.take().len(), 1);

    // Half an hour on, the event is still inside the window and the
    // window key has not moved: the crossing must not repeat.
    evaluator
        .evaluate(&fixture.db, &notifier, at(9, 30))
        .expect("evaluate");
    assert!(notifier.take().is_empty());
}

#[test]
fn provider_scope_ignores_other_providers() {
    let mut fixture = setup();
    let rule = BudgetRule {
        id: "openai-daily".to_string(),
        scope: BudgetScope::Provider("openai".to_string()),
        period: BudgetPeriod::Daily,
        limit: dec("10"),
        thresholds: vec![dec("0.8")],
    };
    let evaluator = BudgetEvaluator::new(vec![rule]);
    let notifier = RecordingNotifier::default();

    let events = vec![spend_event(
        "other",
        "2025-03-15T08:00:00.000Z",
        "anthropic",
        "9",
    )];
    fixture
        .db
        .append_batch(&events, &checkpoint(0))
        .expect("append");

    evaluator
        .evaluate(&fixture.db, &notifier, at(9, 0))
        .expect("evaluate");
    assert!(notifier.take().is_empty());

    add_spend(&mut fixture.db, "mine", "2025-03-15T09:00:00.000Z", "8.5");
    evaluator
        .evaluate(&fixture.db, &notifier, at(10, 0))
        .expect("evaluate");
    let fired = notifier.take();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].scope, BudgetScope::Provider("openai".to_string()));
}

#[test]
fn tiny_spend_crosses_nothing() {
    let mut fixture = setup();
    let evaluator = BudgetEvaluator::new(vec![daily_rule("1.00", &["0.8"])]);
    let notifier = RecordingNotifier::default();

    // A day of light usage: 0.0125 against a 1.00 daily limit.
    add_spend(&mut fixture.db, "s1", "2025-03-15T08:00:00.000Z", "0.005");
    add_spend(&mut fixture.db, "s2", "2025-03-15T08:10:00.000Z", "0.005");
    add_spend(&mut fixture.db, "s3", "2025-03-15T08:20:00.000Z", "0.0025");
    let fired = evaluator
        .evaluate(&fixture.db, &notifier, at(9, 0))
        .expect("evaluate");
    assert!(fired.is_empty());
    assert!(notifier.take().is_empty());
    assert!(
        fixture
            .db
            .alert_state("daily")
            .expect("lookup")
            .is_none()
    );
}
