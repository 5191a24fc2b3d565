use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use ledger_core::{
    PricingTable, UsageEvent, UsageUnits, compute_cost, event_id, format_ts, infer_provider,
    raw_fingerprint,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reader::RawRecord;

/// Log record shapes the normalizer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Assistant session transcripts: `{"type": "message", "message": {...}}`
    /// with usage nested under the message or its metadata.
    Session,
    /// Chat-completions style responses with `usage.prompt_tokens`.
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic transcript lines: `{"type": "assistant", "message": {...}}`.
    Anthropic,
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeReason {
    #[error("not valid JSON")]
    NotJson,
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// Why one record could not be normalized. The record is skipped and
/// counted; the run continues.
#[derive(Debug)]
pub struct NormalizationError {
    pub reason: NormalizeReason,
    pub raw_excerpt: String,
}

const EXCERPT_LEN: usize = 120;

fn excerpt(line: &str) -> String {
    if line.len() <= EXCERPT_LEN {
        return line.to_string();
    }
    let mut cut = EXCERPT_LEN;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    line[..cut].to_string()
}

fn failed(reason: NormalizeReason, line: &str) -> Normalized {
    Normalized::Failed(NormalizationError {
        reason,
        raw_excerpt: excerpt(line),
    })
}

#[derive(Debug)]
pub enum Normalized {
    Event(Box<UsageEvent>),
    /// Valid JSON that simply is not a usage record (tool calls, user
    /// turns, metadata lines). Not an error.
    Skip,
    Failed(NormalizationError),
}

/// Guess the record shape from its first parseable line.
pub fn detect_format(value: &Value) -> Option<LogFormat> {
    if value.get("usage").and_then(|u| u.get("prompt_tokens")).is_some() {
        return Some(LogFormat::OpenAi);
    }
    match value.get("type").and_then(Value::as_str) {
        Some("assistant") if value.get("message").is_some() => Some(LogFormat::Anthropic),
        Some("message") if value.get("message").is_some() => Some(LogFormat::Session),
        _ => None,
    }
}

fn as_u64(value: Option<&Value>) -> u64 {
    value.and_then(Value::as_u64).unwrap_or(0)
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Timestamp extraction tolerant of the field names and encodings seen in
/// the wild. Returns None when nothing usable is present.
fn extract_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    const KEYS: &[&str] = &["timestamp", "ts", "time", "created_at", "created"];
    for key in KEYS {
        let Some(raw) = value.get(*key) else {
            continue;
        };
        if let Some(text) = raw.as_str() {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
        }
        if let Some(secs) = raw.as_i64() {
            // Heuristic: values past the year 33658 are milliseconds.
            let (secs, millis) = if secs > 1_000_000_000_000 {
                (secs / 1000, (secs % 1000) as u32)
            } else {
                (secs, 0)
            };
            if let Some(dt) = Utc.timestamp_opt(secs, millis * 1_000_000).single() {
                return Some(dt);
            }
        }
    }
    None
}

fn session_usage(value: &Value) -> Option<&Value> {
    let message = value.get("message")?;
    message
        .get("usage")
        .or_else(|| message.get("metadata").and_then(|m| m.get("usage")))
}

fn units_from_session(usage: &Value) -> UsageUnits {
    UsageUnits {
        input_units: as_u64(usage.get("input_tokens").or_else(|| usage.get("prompt_tokens"))),
        output_units: as_u64(
            usage
                .get("output_tokens")
                .or_else(|| usage.get("completion_tokens")),
        ),
        cached_units: as_u64(
            usage
                .get("cache_read_input_tokens")
                .or_else(|| usage.get("cached_tokens")),
        ),
    }
}

struct Extracted {
    provider: String,
    model: String,
    units: UsageUnits,
}

fn extract(format: LogFormat, value: &Value) -> Result<Option<Extracted>, NormalizeReason> {
    match format {
        LogFormat::Session => {
            if str_field(value, "type") != Some("message") {
                return Ok(None);
            }
            let Some(message) = value.get("message") else {
                return Ok(None);
            };
            if str_field(message, "role").is_some_and(|role| role != "assistant") {
                return Ok(None);
            }
            let Some(usage) = session_usage(value) else {
                return Ok(None);
            };
            let model = str_field(message, "model")
                .or_else(|| str_field(value, "model"))
                .ok_or(NormalizeReason::MissingField("model"))?;
            let provider = str_field(message, "provider")
                .or_else(|| str_field(value, "provider"))
                .map(str::to_string)
                .unwrap_or_else(|| infer_provider(model).to_string());
            Ok(Some(Extracted {
                provider,
                model: model.to_string(),
                units: units_from_session(usage),
            }))
        }
        LogFormat::OpenAi => {
            let Some(usage) = value.get("usage") else {
                return Ok(None);
            };
            let model =
                str_field(value, "model").ok_or(NormalizeReason::MissingField("model"))?;
            let cached = usage
                .get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens"));
            Ok(Some(Extracted {
                provider: "openai".to_string(),
                model: model.to_string(),
                units: UsageUnits {
                    input_units: as_u64(usage.get("prompt_tokens")),
                    output_units: as_u64(usage.get("completion_tokens")),
                    cached_units: as_u64(cached),
                },
            }))
        }
        LogFormat::Anthropic => {
            if str_field(value, "type") != Some("assistant") {
                return Ok(None);
            }
            let Some(message) = value.get("message") else {
                return Ok(None);
            };
            let Some(usage) = message.get("usage") else {
                return Ok(None);
            };
            let model =
                str_field(message, "model").ok_or(NormalizeReason::MissingField("model"))?;
            Ok(Some(Extracted {
                provider: "anthropic".to_string(),
                model: model.to_string(),
                units: UsageUnits {
                    input_units: as_u64(usage.get("input_tokens")),
                    output_units: as_u64(usage.get("output_tokens")),
                    cached_units: as_u64(usage.get("cache_read_input_tokens")),
                },
            }))
        }
    }
}

/// Turn one raw line into a usage event. Identity derives from the source
/// path, the record's byte offset, and its content, so re-reading the same
/// bytes always yields the same id.
pub fn normalize(
    format: LogFormat,
    record: &RawRecord,
    source: &str,
    epoch: i64,
    pricing: Option<&PricingTable>,
    now: DateTime<Utc>,
) -> Normalized {
    let value: Value = match serde_json::from_str(&record.line) {
        Ok(value) => value,
        Err(_) => return failed(NormalizeReason::NotJson, &record.line),
    };

    let extracted = match extract(format, &value) {
        Ok(Some(extracted)) => extracted,
        Ok(None) => return Normalized::Skip,
        Err(reason) => return failed(reason, &record.line),
    };

    let (occurred_at, occurred_at_inferred) = match extract_timestamp(&value) {
        Some(ts) => (format_ts(ts), false),
        None => (format_ts(now), true),
    };

    let entry = pricing.and_then(|table| table.lookup(&extracted.provider, &extracted.model));
    let cost = entry.map(|entry| compute_cost(extracted.units, entry));
    let pricing_version = match (entry, pricing) {
        (Some(_), Some(table)) => Some(table.version),
        _ => None,
    };

    Normalized::Event(Box::new(UsageEvent {
        id: event_id(source, record.start_offset, &record.line),
        occurred_at,
        occurred_at_inferred,
        provider: extracted.provider,
        model: extracted.model,
        units: extracted.units,
        cost,
        pricing_version,
        source: source.to_string(),
        epoch,
        raw_fingerprint: raw_fingerprint(&record.line),
        raw_json: Some(record.line.clone()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ledger_core::PricingEntry;

    fn record(line: &str) -> RawRecord {
        RawRecord {
            line: line.to_string(),
            start_offset: 0,
            end_offset: line.len() as u64 + 1,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 15, 12, 0, 0).unwrap()
    }

    fn table() -> PricingTable {
        PricingTable {
            version: 1,
            entries: vec![PricingEntry {
                provider: "openai".to_string(),
                model_pattern: "gpt-4o*".to_string(),
                input_per_1m: "5".parse().expect("rate"),
                cached_input_per_1m: "2.5".parse().expect("rate"),
                output_per_1m: "15".parse().expect("rate"),
            }],
        }
    }

    #[test]
    fn session_record_normalizes_with_cost() {
        let line = r#"{"type":"message","timestamp":"2025-03-01T10:00:00Z","message":{"role":"assistant","model":"gpt-4o","usage":{"input_tokens":1000,"output_tokens":500}}}"#;
        let normalized = normalize(
            LogFormat::Session,
            &record(line),
            "/logs/a.jsonl",
            0,
            Some(&table()),
            now(),
        );
        let event = match normalized {
            Normalized::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        };
        assert_eq!(event.provider, "openai");
        assert_eq!(event.model, "gpt-4o");
        assert_eq!(event.units.input_units, 1000);
        assert_eq!(event.units.output_units, 500);
        assert_eq!(event.occurred_at, "2025-03-01T10:00:00.000Z");
        assert!(!event.occurred_at_inferred);
        assert_eq!(event.cost, Some("0.0125".parse().expect("cost")));
        assert_eq!(event.pricing_version, Some(1));
    }

    #[test]
    fn session_provider_falls_back_to_inference() {
        let line = r#"{"type":"message","message":{"role":"assistant","model":"claude-3-5-sonnet","usage":{"input_tokens":10,"output_tokens":5}}}"#;
        let normalized = normalize(
            LogFormat::Session,
            &record(line),
            "/logs/a.jsonl",
            0,
            None,
            now(),
        );
        match normalized {
            Normalized::Event(event) => assert_eq!(event.provider, "anthropic"),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn non_assistant_turns_are_skipped() {
        let line = r#"{"type":"message","message":{"role":"user","content":"hi"}}"#;
        let normalized = normalize(
            LogFormat::Session,
            &record(line),
            "/logs/a.jsonl",
            0,
            None,
            now(),
        );
        assert!(matches!(normalized, Normalized::Skip));
    }

    #[test]
    fn openai_record_extracts_cached_tokens() {
        let line = r#"{"model":"gpt-4o-mini","created":1741860000,"usage":{"prompt_tokens":200,"completion_tokens":80,"prompt_tokens_details":{"cached_tokens":50}}}"#;
        let normalized = normalize(
            LogFormat::OpenAi,
            &record(line),
            "/logs/api.jsonl",
            0,
            None,
            now(),
        );
        let event = match normalized {
            Normalized::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        };
        assert_eq!(event.provider, "openai");
        assert_eq!(event.units.cached_units, 50);
        assert!(!event.occurred_at_inferred);
        assert!(event.cost.is_none());
    }

    #[test]
    fn anthropic_record_normalizes() {
        let line = r#"{"type":"assistant","timestamp":"2025-03-01T10:00:00.500Z","message":{"model":"claude-3-5-sonnet","usage":{"input_tokens":500,"output_tokens":250,"cache_read_input_tokens":100}}}"#;
        let normalized = normalize(
            LogFormat::Anthropic,
            &record(line),
            "/logs/b.jsonl",
            0,
            None,
            now(),
        );
        let event = match normalized {
            Normalized::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        };
        assert_eq!(event.provider, "anthropic");
        assert_eq!(event.units.cached_units, 100);
        assert_eq!(event.occurred_at, "2025-03-01T10:00:00.500Z");
    }

    #[test]
    fn missing_timestamp_uses_ingestion_time_and_flags_it() {
        let line = r#"{"type":"message","message":{"role":"assistant","model":"gpt-4o","usage":{"input_tokens":1,"output_tokens":1}}}"#;
        let normalized = normalize(
            LogFormat::Session,
            &record(line),
            "/logs/a.jsonl",
            0,
            None,
            now(),
        );
        match normalized {
            Normalized::Event(event) => {
                assert!(event.occurred_at_inferred);
                assert_eq!(event.occurred_at, "2025-03-15T12:00:00.000Z");
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_fails_with_excerpt() {
        let line = "{\"type\": \"message\", truncated";
        let normalized = normalize(
            LogFormat::Session,
            &record(line),
            "/logs/a.jsonl",
            0,
            None,
            now(),
        );
        match normalized {
            Normalized::Failed(err) => {
                assert!(matches!(err.reason, NormalizeReason::NotJson));
                assert_eq!(err.raw_excerpt, line);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn missing_model_is_a_failure_not_a_skip() {
        let line = r#"{"type":"message","message":{"role":"assistant","usage":{"input_tokens":1,"output_tokens":1}}}"#;
        let normalized = normalize(
            LogFormat::Session,
            &record(line),
            "/logs/a.jsonl",
            0,
            None,
            now(),
        );
        match normalized {
            Normalized::Failed(err) => {
                assert!(matches!(
                    err.reason,
                    NormalizeReason::MissingField("model")
                ));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn format_detection_fingerprints_schemas() {
        let session: Value =
            serde_json::from_str(r#"{"type":"message","message":{"role":"assistant"}}"#)
                .expect("json");
        let openai: Value =
            serde_json::from_str(r#"{"model":"gpt-4o","usage":{"prompt_tokens":1}}"#)
                .expect("json");
        let anthropic: Value =
            serde_json::from_str(r#"{"type":"assistant","message":{"usage":{}}}"#).expect("json");
        let other: Value = serde_json::from_str(r#"{"hello":"world"}"#).expect("json");

        assert_eq!(detect_format(&session), Some(LogFormat::Session));
        assert_eq!(detect_format(&openai), Some(LogFormat::OpenAi));
        assert_eq!(detect_format(&anthropic), Some(LogFormat::Anthropic));
        assert_eq!(detect_format(&other), None);
    }
}
