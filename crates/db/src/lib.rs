use std::path::Path;

use rusqlite::Connection;

mod analytics;
mod budgets;
mod checkpoints;
mod error;
mod events;
mod pricing;
mod types;

pub use budgets::AlertState;
pub use error::{DbError, Result};
pub use types::{
    Bucket, EventFilter, ModelSpend, ProviderSpend, SourceCheckpoint, SpendPoint, SpendSummary,
};

pub const MIGRATION_0001: &str = include_str!("../migrations/0001_init.sql");

pub const MIGRATIONS: &[(&str, &str)] = &[("0001_init", MIGRATION_0001)];

/// The ledger store. Exclusively owns persisted usage events, source
/// checkpoints, pricing snapshots and alert state.
pub struct Db {
    pub(crate) conn: Connection,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Lock contention from concurrent writers shows up as a timeout,
        // which callers treat as a transient failure.
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        Ok(Self { conn })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (_name, sql) in MIGRATIONS {
            tx.execute_batch(sql)?;
        }
        tx.commit()?;
        Ok(())
    }
}
