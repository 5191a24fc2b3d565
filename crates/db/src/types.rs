use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Durable marker of ingestion progress for one source. Advanced in the
/// same transaction as the events it covers, never ahead of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCheckpoint {
    pub source: String,
    pub byte_offset: u64,
    /// Incremented every time the source is detected as rotated or
    /// truncated; events record the epoch they were read under.
    pub epoch: i64,
    /// Length of the prefix covered by `head_hash`.
    pub head_len: u64,
    /// Hash of the first `head_len` bytes of the source at checkpoint
    /// time. A mismatch on resume means the file was rewritten in place.
    pub head_hash: Option<String>,
    pub last_event_id: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Hour,
    Day,
}

/// Row filters for event queries and aggregations.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl EventFilter {
    pub fn provider(name: &str) -> Self {
        Self {
            provider: Some(name.to_string()),
            ..Self::default()
        }
    }
}

/// Aggregate spend over a time range, computed inside SQLite.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpendSummary {
    pub input_units: u64,
    pub output_units: u64,
    pub cached_units: u64,
    /// Sum over priced events only.
    pub cost: Decimal,
    pub priced_events: u64,
    /// Events stored without a cost because no pricing entry matched.
    pub unpriced_events: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSpend {
    pub provider: String,
    pub total_units: u64,
    pub cost: Decimal,
    pub unpriced_events: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSpend {
    pub provider: String,
    pub model: String,
    pub total_units: u64,
    pub cost: Decimal,
    pub unpriced_events: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpendPoint {
    pub bucket_start: String,
    pub total_units: u64,
    pub cost: Decimal,
}
