use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use ledger_core::AlertTransition;
use ledger_db::Db;
use ledger_ingest::{IngestStats, SourceSpec, WatchOptions, ingest_all, watch_sources};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::budget::BudgetEvaluator;
use crate::config::AppConfig;
use crate::error::Result;
use crate::notify::Notifier;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of one batch run: what was ingested and which thresholds
/// newly fired.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub ingest: IngestStats,
    pub alerts: Vec<AlertTransition>,
}

/// Wires the store, the ingestion engine and the budget evaluator
/// together from one validated configuration.
pub struct App {
    db: Arc<Mutex<Db>>,
    sources: Vec<SourceSpec>,
    evaluator: BudgetEvaluator,
    poll_interval: Duration,
}

impl App {
    /// Open the ledger, apply migrations, and sync configured pricing.
    /// Pricing only gets a new version when the configured entries differ
    /// from the latest stored snapshot.
    pub fn open(config: &AppConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut db = Db::open(&config.db_path)?;
        db.migrate()?;

        let configured = config.pricing_entries();
        if !configured.is_empty() {
            let current = db.pricing_table()?;
            let unchanged = current
                .as_ref()
                .is_some_and(|table| table.entries == configured);
            if !unchanged {
                let version = db.replace_pricing(&configured)?;
                info!(version, entries = configured.len(), "pricing table updated");
            }
        }

        let evaluator = BudgetEvaluator::new(config.budget_rules()?);
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            sources: config.source_specs(),
            evaluator,
            poll_interval: config
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        })
    }

    pub fn db(&self) -> Arc<Mutex<Db>> {
        Arc::clone(&self.db)
    }

    fn lock(&self) -> MutexGuard<'_, Db> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One pass: ingest every source to its current end, then evaluate
    /// budgets against the updated ledger.
    pub fn run_batch(&self, notifier: &dyn Notifier) -> Result<RunReport> {
        let ingest = ingest_all(&self.db, &self.sources)?;
        let alerts = self.evaluate_budgets(notifier)?;
        Ok(RunReport { ingest, alerts })
    }

    pub fn evaluate_budgets(&self, notifier: &dyn Notifier) -> Result<Vec<AlertTransition>> {
        let db = self.lock();
        self.evaluator.evaluate(&db, notifier, Utc::now())
    }

    /// Tail sources until cancelled, re-evaluating budgets on the same
    /// cadence as the source polls.
    pub async fn run_watch(
        &self,
        notifier: Arc<dyn Notifier>,
        cancel: CancellationToken,
    ) -> Result<IngestStats> {
        let options = WatchOptions {
            poll_interval: self.poll_interval,
        };
        let watcher = tokio::spawn(watch_sources(
            Arc::clone(&self.db),
            self.sources.clone(),
            options,
            cancel.clone(),
        ));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if let Err(err) = self.evaluate_budgets(notifier.as_ref()) {
                error!(error = %err, "budget evaluation failed");
            }
        }

        let stats = watcher
            .await
            .map_err(|err| std::io::Error::other(format!("watch task failed: {err}")))??;
        // Final evaluation so spend landed by the last cycle is covered.
        self.evaluate_budgets(notifier.as_ref())?;
        Ok(stats)
    }
}
