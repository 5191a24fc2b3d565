//! Application layer: configuration, the batch/watch runners, and budget
//! alerting on top of the ledger.

mod budget;
mod config;
mod error;
mod notify;
mod runner;

pub use budget::BudgetEvaluator;
pub use config::{AppConfig, BudgetConfig, ConfigError, PricingConfig, SourceConfig};
pub use error::{AppError, Result};
pub use notify::{LogNotifier, Notifier, RecordingNotifier};
pub use runner::{App, RunReport};
