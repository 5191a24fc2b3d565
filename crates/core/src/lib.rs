use std::fmt::Write;

use chrono::{DateTime, Datelike, Duration, NaiveTime, SecondsFormat, Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Scale used for stored monetary amounts. Nine decimal places keeps
/// per-token prices exact and fits in an i64 nano-USD column.
pub const MONEY_SCALE: u32 = 9;

const NANOS_PER_USD: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageUnits {
    pub input_units: u64,
    pub output_units: u64,
    pub cached_units: u64,
}

impl UsageUnits {
    pub fn total(&self) -> u64 {
        self.input_units.saturating_add(self.output_units)
    }
}

/// Normalized record of one billable AI API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub occurred_at: String,
    /// True when the log record carried no usable timestamp and the
    /// ingestion-time stamp was substituted.
    pub occurred_at_inferred: bool,
    pub provider: String,
    pub model: String,
    pub units: UsageUnits,
    /// None means the pricing table had no entry for (provider, model);
    /// the event is still stored so unit counts are never lost.
    pub cost: Option<Decimal>,
    /// Pricing table version the stored cost was computed against.
    pub pricing_version: Option<i64>,
    pub source: String,
    /// Rotation epoch of the source at ingest time.
    pub epoch: i64,
    pub raw_fingerprint: String,
    pub raw_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub provider: String,
    pub model_pattern: String,
    pub input_per_1m: Decimal,
    pub cached_input_per_1m: Decimal,
    pub output_per_1m: Decimal,
}

/// Immutable, versioned snapshot of the pricing table. Updates produce a
/// new snapshot; stored events keep the version that priced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    pub version: i64,
    pub entries: Vec<PricingEntry>,
}

impl PricingTable {
    pub fn lookup(&self, provider: &str, model: &str) -> Option<&PricingEntry> {
        self.entries
            .iter()
            .find(|entry| entry.provider == provider && model_matches(model, &entry.model_pattern))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetScope {
    Global,
    Provider(String),
}

impl BudgetScope {
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::Provider(name) => Some(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
    /// Rolling window ending at evaluation time.
    Window {
        hours: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRule {
    pub id: String,
    pub scope: BudgetScope,
    pub period: BudgetPeriod,
    pub limit: Decimal,
    /// Threshold fractions of the limit, e.g. [0.8, 1.0].
    pub thresholds: Vec<Decimal>,
}

/// A threshold crossing handed to the notifier. Fired at most once per
/// (rule, period, fraction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTransition {
    pub rule_id: String,
    pub scope: BudgetScope,
    pub fraction: Decimal,
    pub period: TimeRange,
    pub spend: Decimal,
    pub limit: Decimal,
}

/// Half-open range of RFC3339 UTC timestamps; `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn day_start(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(dt.date_naive().and_time(NaiveTime::MIN), Utc)
}

fn month_start(dt: DateTime<Utc>) -> DateTime<Utc> {
    let first = dt
        .date_naive()
        .with_day(1)
        .unwrap_or_else(|| dt.date_naive());
    DateTime::from_naive_utc_and_offset(first.and_time(NaiveTime::MIN), Utc)
}

fn next_month_start(dt: DateTime<Utc>) -> DateTime<Utc> {
    let date = dt.date_naive();
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let first = chrono::NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date);
    DateTime::from_naive_utc_and_offset(first.and_time(NaiveTime::MIN), Utc)
}

fn hour_start(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_minute(0)
        .and_then(|value| value.with_second(0))
        .and_then(|value| value.with_nanosecond(0))
        .unwrap_or(dt)
}

impl BudgetPeriod {
    /// Bucket boundaries for the period containing `now`, in UTC.
    pub fn range_at(&self, now: DateTime<Utc>) -> TimeRange {
        let (start, end) = match self {
            Self::Daily => {
                let start = day_start(now);
                (start, start + Duration::days(1))
            }
            Self::Weekly => {
                let days_back = now.date_naive().weekday().num_days_from_monday() as i64;
                let start = day_start(now) - Duration::days(days_back);
                (start, start + Duration::days(7))
            }
            Self::Monthly => (month_start(now), next_month_start(now)),
            Self::Window { hours } => {
                let start = now - Duration::hours(i64::from(*hours));
                (start, now)
            }
        };
        TimeRange {
            start: format_ts(start),
            end: format_ts(end),
        }
    }

    /// Stable key identifying the period for alert-state bookkeeping.
    /// Calendar periods use their start; rolling windows truncate the
    /// moving start to the hour so repeated evaluations within the same
    /// hour share a period.
    pub fn state_key(&self, now: DateTime<Utc>) -> String {
        match self {
            Self::Window { hours } => {
                format_ts(hour_start(now - Duration::hours(i64::from(*hours))))
            }
            _ => self.range_at(now).start,
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Deterministic event identity: a function of where the record sits and
/// what it says, never of the wall clock. Re-parsing the same bytes at the
/// same offset yields the same id, which is what makes re-scans idempotent.
pub fn event_id(source: &str, offset: u64, line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(offset.to_be_bytes());
    hasher.update(b"\x1f");
    hasher.update(line.as_bytes());
    hex_digest(&hasher.finalize())
}

/// Content-only hash of the raw record, independent of position.
pub fn raw_fingerprint(line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(line.as_bytes());
    hex_digest(&hasher.finalize())
}

/// Wildcard match of a model name against a pricing pattern. `*` matches
/// any run of characters; comparison is case-insensitive.
pub fn model_matches(model: &str, pattern: &str) -> bool {
    let model = model.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return model == pattern;
    }
    let mut remainder = model.as_str();
    let mut anchored = !pattern.starts_with('*');
    for part in pattern.split('*').filter(|part| !part.is_empty()) {
        match remainder.find(part) {
            Some(index) => {
                if anchored && index != 0 {
                    return false;
                }
                remainder = &remainder[index + part.len()..];
                anchored = false;
            }
            None => return false,
        }
    }
    pattern.ends_with('*') || remainder.is_empty()
}

/// Cost of a usage delta under one pricing entry. All arithmetic is
/// fixed-point Decimal; the result is rounded to [`MONEY_SCALE`] so the
/// same inputs always produce the same bytes.
pub fn compute_cost(units: UsageUnits, entry: &PricingEntry) -> Decimal {
    let per_million = Decimal::from(1_000_000u64);
    let non_cached = Decimal::from(units.input_units.saturating_sub(units.cached_units));
    let cached = Decimal::from(units.cached_units);
    let output = Decimal::from(units.output_units);
    let cost = non_cached / per_million * entry.input_per_1m
        + cached / per_million * entry.cached_input_per_1m
        + output / per_million * entry.output_per_1m;
    cost.round_dp(MONEY_SCALE)
}

/// Stored representation of a cost: integer nano-USD, aggregatable in SQL
/// without floating-point drift. Saturates far outside any plausible spend.
pub fn cost_to_nanos(cost: Decimal) -> i64 {
    let scaled = (cost * Decimal::from(NANOS_PER_USD)).round();
    scaled.to_i64().unwrap_or(i64::MAX)
}

pub fn nanos_to_cost(nanos: i64) -> Decimal {
    Decimal::new(nanos, MONEY_SCALE).normalize()
}

/// Best-effort provider attribution when a record names a model but not a
/// provider.
pub fn infer_provider(model: &str) -> &'static str {
    let model = model.to_ascii_lowercase();
    const PREFIXES: &[(&str, &str)] = &[
        ("gpt-", "openai"),
        ("o1-", "openai"),
        ("o3-", "openai"),
        ("text-", "openai"),
        ("claude-", "anthropic"),
        ("gemini-", "google"),
        ("palm-", "google"),
        ("deepseek-", "deepseek"),
        ("command-", "cohere"),
        ("mistral-", "mistral"),
        ("mixtral", "mistral"),
    ];
    for (prefix, provider) in PREFIXES {
        if model.starts_with(prefix) || model.contains(provider) {
            return provider;
        }
    }
    "unknown"
}
