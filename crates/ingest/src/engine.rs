use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use ledger_core::{PricingTable, format_ts};
use ledger_db::{Db, SourceCheckpoint};
use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::normalize::{LogFormat, Normalized, detect_format, normalize};
use crate::reader::{ReadOutcome, Resume, read_batch};
use crate::types::{IngestError, IngestIssue, IngestStats, Result, SourceSpec};

/// Upper bound on records normalized and written per transaction.
pub const MAX_BATCH_RECORDS: usize = 2000;
const MAX_WRITE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

const LOG_EXTENSIONS: &[&str] = &["jsonl", "ndjson", "log"];

pub(crate) fn lock_db(db: &Mutex<Db>) -> MutexGuard<'_, Db> {
    db.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_log_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| LOG_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Expand a source spec into concrete file tasks. Directories are walked
/// recursively; only files with a known log extension qualify.
pub fn expand(spec: &SourceSpec) -> Result<Vec<FileTask>> {
    let meta = std::fs::metadata(&spec.path).map_err(|err| IngestError::SourceUnavailable {
        path: spec.path.display().to_string(),
        source: err,
    })?;
    if meta.is_file() {
        return Ok(vec![FileTask {
            path: spec.path.clone(),
            format_hint: spec.format_hint,
        }]);
    }

    let mut tasks = Vec::new();
    for entry in WalkDir::new(&spec.path).follow_links(false) {
        let entry = entry.map_err(|err| {
            let io = err
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk failed"));
            IngestError::SourceUnavailable {
                path: spec.path.display().to_string(),
                source: io,
            }
        })?;
        if entry.file_type().is_file() && is_log_file(entry.path()) {
            tasks.push(FileTask {
                path: entry.path().to_path_buf(),
                format_hint: spec.format_hint,
            });
        }
    }
    tasks.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(tasks)
}

#[derive(Debug, Clone)]
pub struct FileTask {
    pub path: PathBuf,
    pub format_hint: Option<LogFormat>,
}

/// Ingest one file to its current end, resuming from its checkpoint.
/// Writes happen in batches; the checkpoint moves in the same transaction
/// as the events it covers, so a crash re-processes but never skips.
pub fn ingest_file(
    db: &Mutex<Db>,
    task: &FileTask,
    pricing: Option<&PricingTable>,
) -> Result<IngestStats> {
    let source = task.path.display().to_string();
    let mut stats = IngestStats {
        files_scanned: 1,
        ..IngestStats::default()
    };

    let mut resume = Resume::from_checkpoint(lock_db(db).checkpoint(&source)?.as_ref());
    let mut format = task.format_hint;

    loop {
        let outcome = read_batch(&task.path, &resume, MAX_BATCH_RECORDS).map_err(|err| {
            IngestError::SourceUnavailable {
                path: source.clone(),
                source: err,
            }
        })?;

        let batch = match outcome {
            ReadOutcome::Batch(batch) => batch,
            ReadOutcome::Rotated => {
                info!(source = %source, epoch = resume.epoch + 1, "source rotated, rescanning");
                stats.rotations += 1;
                resume = Resume {
                    byte_offset: 0,
                    epoch: resume.epoch + 1,
                    head_len: 0,
                    head_hash: None,
                };
                let checkpoint = SourceCheckpoint {
                    source: source.clone(),
                    byte_offset: 0,
                    epoch: resume.epoch,
                    head_len: 0,
                    head_hash: None,
                    last_event_id: None,
                    updated_at: format_ts(Utc::now()),
                };
                lock_db(db).upsert_checkpoint(&checkpoint)?;
                continue;
            }
        };

        if batch.records.is_empty() && batch.end_offset == resume.byte_offset {
            break;
        }
        stats.bytes_read += batch.end_offset - batch.start_offset;

        let now = Utc::now();
        let mut events = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            if format.is_none() {
                if let Ok(value) = serde_json::from_str::<Value>(&record.line) {
                    format = detect_format(&value);
                    if let Some(found) = format {
                        debug!(source = %source, format = ?found, "detected log format");
                    }
                }
            }
            let Some(format) = format else {
                stats.records_failed += 1;
                continue;
            };
            match normalize(format, record, &source, resume.epoch, pricing, now) {
                Normalized::Event(event) => {
                    if event.cost.is_none() {
                        stats.events_unpriced += 1;
                    }
                    events.push(*event);
                }
                Normalized::Skip => {}
                Normalized::Failed(err) => {
                    stats.records_failed += 1;
                    debug!(source = %source, reason = %err.reason, excerpt = %err.raw_excerpt, "record failed normalization");
                }
            }
        }

        // Pre-check so dedup counts are observable; the INSERT OR IGNORE
        // underneath still guarantees correctness under races.
        let ids: Vec<String> = events.iter().map(|event| event.id.clone()).collect();
        let existing = lock_db(db).existing_event_ids(&ids)?;
        let fresh: Vec<_> = events
            .into_iter()
            .filter(|event| !existing.contains(&event.id))
            .collect();
        stats.events_deduped += ids.len() - fresh.len();

        let checkpoint = SourceCheckpoint {
            source: source.clone(),
            byte_offset: batch.end_offset,
            epoch: resume.epoch,
            head_len: batch.head_len,
            head_hash: batch.head_hash.clone(),
            last_event_id: fresh.last().map(|event| event.id.clone()),
            updated_at: format_ts(Utc::now()),
        };
        stats.events_inserted += write_with_retry(db, &fresh, &checkpoint)?;

        resume.byte_offset = batch.end_offset;
        resume.head_len = batch.head_len;
        resume.head_hash = batch.head_hash;

        if !batch.has_more {
            break;
        }
    }

    Ok(stats)
}

/// Delay before retry `attempt + 1`, doubling per failed attempt.
fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Transient store failures get bounded retries with exponential backoff;
/// exhaustion surfaces as a per-source error so other sources keep going.
fn write_with_retry(
    db: &Mutex<Db>,
    events: &[ledger_core::UsageEvent],
    checkpoint: &SourceCheckpoint,
) -> Result<usize> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match lock_db(db).append_batch(events, checkpoint) {
            Ok(inserted) => return Ok(inserted),
            Err(err) if attempt < MAX_WRITE_ATTEMPTS => {
                warn!(source = %checkpoint.source, attempt, error = %err, "ledger write failed, retrying");
                std::thread::sleep(retry_delay(attempt));
            }
            Err(err) => {
                return Err(IngestError::LedgerWrite {
                    attempts: attempt,
                    source: err,
                });
            }
        }
    }
}

/// One ingestion pass over every configured source. Files are parsed in
/// parallel; a failing source is recorded as an issue and the rest
/// continue.
pub fn ingest_all(db: &Mutex<Db>, specs: &[SourceSpec]) -> Result<IngestStats> {
    let pricing = lock_db(db).pricing_table()?;
    let mut stats = IngestStats::default();

    let mut tasks = Vec::new();
    for spec in specs {
        match expand(spec) {
            Ok(found) => tasks.extend(found),
            Err(err) => {
                warn!(source = %spec.path.display(), error = %err, "source unavailable");
                stats.sources_failed += 1;
                stats.issues.push(IngestIssue {
                    source: spec.path.display().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    let results: Vec<(String, Result<IngestStats>)> = tasks
        .into_par_iter()
        .map(|task| {
            let source = task.path.display().to_string();
            let result = ingest_file(db, &task, pricing.as_ref());
            (source, result)
        })
        .collect();

    for (source, result) in results {
        match result {
            Ok(file_stats) => stats.merge(file_stats),
            Err(err) => {
                warn!(source = %source, error = %err, "file ingestion failed");
                stats.files_skipped += 1;
                stats.sources_failed += 1;
                stats.issues.push(IngestIssue {
                    source,
                    message: err.to_string(),
                });
            }
        }
    }

    info!(
        inserted = stats.events_inserted,
        deduped = stats.events_deduped,
        failed = stats.records_failed,
        rotations = stats.rotations,
        "ingestion pass complete"
    );
    Ok(stats)
}
