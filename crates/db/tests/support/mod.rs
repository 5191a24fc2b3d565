#![allow(dead_code)]

use std::path::PathBuf;

use ledger_core::{PricingEntry, UsageEvent, UsageUnits, raw_fingerprint};
use ledger_db::{Db, SourceCheckpoint};
use tempfile::TempDir;

pub struct TestDb {
    pub _dir: TempDir,
    pub db: Db,
    pub path: PathBuf,
}

pub fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("ledger.sqlite");
    let mut db = Db::open(&path).expect("open db");
    db.migrate().expect("migrate db");
    TestDb {
        _dir: dir,
        db,
        path,
    }
}

pub fn make_event(
    id: &str,
    occurred_at: &str,
    provider: &str,
    model: &str,
    units: UsageUnits,
    cost: Option<&str>,
    source: &str,
) -> UsageEvent {
    UsageEvent {
        id: id.to_string(),
        occurred_at: occurred_at.to_string(),
        occurred_at_inferred: false,
        provider: provider.to_string(),
        model: model.to_string(),
        units,
        cost: cost.map(|value| value.parse().expect("cost decimal")),
        pricing_version: cost.map(|_| 1),
        source: source.to_string(),
        epoch: 0,
        raw_fingerprint: raw_fingerprint(id),
        raw_json: None,
    }
}

pub fn make_checkpoint(source: &str, byte_offset: u64) -> SourceCheckpoint {
    SourceCheckpoint {
        source: source.to_string(),
        byte_offset,
        epoch: 0,
        head_len: 0,
        head_hash: None,
        last_event_id: None,
        updated_at: "2025-01-01T00:00:00.000Z".to_string(),
    }
}

pub fn units(input: u64, output: u64, cached: u64) -> UsageUnits {
    UsageUnits {
        input_units: input,
        output_units: output,
        cached_units: cached,
    }
}

pub fn pricing_entry(provider: &str, pattern: &str, input: &str, output: &str) -> PricingEntry {
    PricingEntry {
        provider: provider.to_string(),
        model_pattern: pattern.to_string(),
        input_per_1m: input.parse().expect("input rate"),
        cached_input_per_1m: "0".parse().expect("cached rate"),
        output_per_1m: output.parse().expect("output rate"),
    }
}
