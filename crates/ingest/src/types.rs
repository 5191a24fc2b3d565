use std::io;
use std::path::PathBuf;

use serde::Serialize;

use crate::normalize::LogFormat;

/// One configured log source: a session file or a directory of them.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub path: PathBuf,
    /// Explicit format from configuration; when absent the first
    /// parseable record's schema fingerprint decides.
    pub format_hint: Option<LogFormat>,
}

impl SourceSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format_hint: None,
        }
    }

    pub fn with_format(path: impl Into<PathBuf>, format: LogFormat) -> Self {
        Self {
            path: path.into(),
            format_hint: Some(format),
        }
    }
}

/// Summary of one ingestion run (or one watch cycle).
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub sources_failed: usize,
    pub events_inserted: usize,
    /// Events dropped because their id was already stored.
    pub events_deduped: usize,
    /// Events stored without a cost for lack of a pricing entry.
    pub events_unpriced: usize,
    /// Records that failed normalization and were skipped.
    pub records_failed: usize,
    pub rotations: usize,
    pub bytes_read: u64,
    pub issues: Vec<IngestIssue>,
}

impl IngestStats {
    pub fn merge(&mut self, other: IngestStats) {
        self.files_scanned += other.files_scanned;
        self.files_skipped += other.files_skipped;
        self.sources_failed += other.sources_failed;
        self.events_inserted += other.events_inserted;
        self.events_deduped += other.events_deduped;
        self.events_unpriced += other.events_unpriced;
        self.records_failed += other.records_failed;
        self.rotations += other.rotations;
        self.bytes_read += other.bytes_read;
        self.issues.extend(other.issues);
    }
}

/// Non-fatal problems encountered while ingesting; the run continues.
#[derive(Debug, Clone, Serialize)]
pub struct IngestIssue {
    pub source: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("source unavailable: {path}: {source}")]
    SourceUnavailable {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("ledger write failed after {attempts} attempts: {source}")]
    LedgerWrite {
        attempts: u32,
        #[source]
        source: ledger_db::DbError,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("db error: {0}")]
    Db(#[from] ledger_db::DbError),
}

pub type Result<T> = std::result::Result<T, IngestError>;
