use chrono::Utc;
use ledger_core::{PricingEntry, PricingTable, format_ts};
use rusqlite::{OptionalExtension, params};
use rust_decimal::Decimal;

use crate::Db;
use crate::error::Result;

impl Db {
    /// Installs a new pricing snapshot and returns its version. Older
    /// versions are kept so stored costs remain auditable.
    pub fn replace_pricing(&mut self, entries: &[PricingEntry]) -> Result<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO pricing_version (created_at) VALUES (?1)",
            params![format_ts(Utc::now())],
        )?;
        let version = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO pricing_entry (
                  version, provider, model_pattern,
                  input_per_1m, cached_input_per_1m, output_per_1m
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for entry in entries {
                stmt.execute(params![
                    version,
                    entry.provider,
                    entry.model_pattern,
                    entry.input_per_1m.to_string(),
                    entry.cached_input_per_1m.to_string(),
                    entry.output_per_1m.to_string(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(version)
    }

    /// Latest pricing snapshot, or None before any has been installed.
    pub fn pricing_table(&self) -> Result<Option<PricingTable>> {
        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM pricing_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();
        let Some(version) = version else {
            return Ok(None);
        };
        Ok(Some(self.pricing_table_at(version)?))
    }

    /// The snapshot a stored event's `pricing_version` refers to.
    pub fn pricing_table_at(&self, version: i64) -> Result<PricingTable> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT provider, model_pattern, input_per_1m, cached_input_per_1m, output_per_1m
            FROM pricing_entry
            WHERE version = ?1
            ORDER BY id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![version])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(PricingEntry {
                provider: row.get(0)?,
                model_pattern: row.get(1)?,
                input_per_1m: row.get::<_, String>(2)?.parse::<Decimal>()?,
                cached_input_per_1m: row.get::<_, String>(3)?.parse::<Decimal>()?,
                output_per_1m: row.get::<_, String>(4)?.parse::<Decimal>()?,
            });
        }
        Ok(PricingTable { version, entries })
    }
}
