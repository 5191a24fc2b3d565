use std::sync::{Arc, Mutex};
use std::time::Duration;

use ledger_db::Db;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::engine::{expand, ingest_file, lock_db};
use crate::types::{IngestError, IngestIssue, IngestStats, Result, SourceSpec};

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Tail every configured source until cancelled. Each source gets its own
/// task; a source whose writes exhaust their retries stops, the others
/// keep polling. Cancellation is honored between scan cycles, never
/// mid-batch, so the checkpoint invariant holds across shutdown.
pub async fn watch_sources(
    db: Arc<Mutex<Db>>,
    specs: Vec<SourceSpec>,
    options: WatchOptions,
    cancel: CancellationToken,
) -> Result<IngestStats> {
    let mut handles = Vec::with_capacity(specs.len());
    for spec in specs {
        let db = Arc::clone(&db);
        let cancel = cancel.clone();
        let interval = options.poll_interval;
        handles.push(tokio::spawn(watch_one(db, spec, interval, cancel)));
    }

    let mut stats = IngestStats::default();
    for handle in handles {
        match handle.await {
            Ok(task_stats) => stats.merge(task_stats),
            Err(err) => {
                error!(error = %err, "watch task panicked");
            }
        }
    }
    Ok(stats)
}

async fn watch_one(
    db: Arc<Mutex<Db>>,
    spec: SourceSpec,
    interval: Duration,
    cancel: CancellationToken,
) -> IngestStats {
    let label = spec.path.display().to_string();
    let mut stats = IngestStats::default();

    loop {
        let db_for_scan = Arc::clone(&db);
        let spec_for_scan = spec.clone();
        let scan = tokio::task::spawn_blocking(move || scan_cycle(&db_for_scan, &spec_for_scan));
        match scan.await {
            Ok((cycle, fatal)) => {
                stats.merge(cycle);
                if fatal {
                    error!(source = %label, "watcher stopping after exhausted write retries");
                    break;
                }
            }
            Err(err) => {
                error!(source = %label, error = %err, "scan cycle panicked");
                stats.issues.push(IngestIssue {
                    source: label.clone(),
                    message: format!("scan cycle panicked: {err}"),
                });
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(source = %label, "watcher shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    stats
}

/// One synchronous pass over a source; the bool says whether the watcher
/// should stop. Directories are re-expanded every cycle so files created
/// after startup are picked up.
fn scan_cycle(db: &Mutex<Db>, spec: &SourceSpec) -> (IngestStats, bool) {
    let mut stats = IngestStats::default();
    let tasks = match expand(spec) {
        Ok(tasks) => tasks,
        Err(err) => {
            // A source may be briefly absent (rotation in flight); keep
            // polling unless writes are failing.
            stats.sources_failed += 1;
            stats.issues.push(IngestIssue {
                source: spec.path.display().to_string(),
                message: err.to_string(),
            });
            return (stats, false);
        }
    };

    let pricing = match lock_db(db).pricing_table() {
        Ok(pricing) => pricing,
        Err(err) => {
            stats.issues.push(IngestIssue {
                source: spec.path.display().to_string(),
                message: IngestError::from(err).to_string(),
            });
            return (stats, false);
        }
    };

    let mut fatal = false;
    for task in tasks {
        match ingest_file(db, &task, pricing.as_ref()) {
            Ok(file_stats) => stats.merge(file_stats),
            Err(err) => {
                if matches!(err, IngestError::LedgerWrite { .. }) {
                    fatal = true;
                }
                stats.files_skipped += 1;
                stats.issues.push(IngestIssue {
                    source: task.path.display().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }
    (stats, fatal)
}
