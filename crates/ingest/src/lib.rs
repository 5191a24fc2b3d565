//! Log ingestion: incremental readers over JSONL sources, provider-format
//! normalization, and batch/watch drivers that land events in the ledger.

mod engine;
mod normalize;
mod reader;
mod types;
mod watch;

pub use engine::{FileTask, MAX_BATCH_RECORDS, expand, ingest_all, ingest_file};
pub use normalize::{LogFormat, NormalizationError, NormalizeReason, Normalized, normalize};
pub use reader::{HEAD_HASH_LEN, RawRecord, ReadBatch, ReadOutcome, Resume, read_batch};
pub use types::{IngestError, IngestIssue, IngestStats, Result, SourceSpec};
pub use watch::{WatchOptions, watch_sources};
