use std::collections::HashSet;

use ledger_core::{TimeRange, UsageEvent, UsageUnits, cost_to_nanos, nanos_to_cost};
use rusqlite::{Row, params, params_from_iter, types::Value};

use crate::Db;
use crate::checkpoints::upsert_checkpoint_tx;
use crate::error::Result;
use crate::types::{EventFilter, SourceCheckpoint};

impl Db {
    /// Appends a batch of events and advances the source's checkpoint in a
    /// single transaction. Events go first, checkpoint second; a crash
    /// between the two re-processes records but never skips any. Duplicate
    /// ids are ignored, making the store the final dedup authority.
    pub fn append_batch(
        &mut self,
        events: &[UsageEvent],
        checkpoint: &SourceCheckpoint,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO usage_event (
                  id, occurred_at, occurred_at_inferred, provider, model,
                  input_units, output_units, cached_units, cost_nanos,
                  pricing_version, source, epoch, raw_fingerprint, raw_json
                ) VALUES (
                  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
                )
                "#,
            )?;
            for event in events {
                let rows = stmt.execute(params![
                    event.id,
                    event.occurred_at,
                    event.occurred_at_inferred,
                    event.provider,
                    event.model,
                    event.units.input_units as i64,
                    event.units.output_units as i64,
                    event.units.cached_units as i64,
                    event.cost.map(cost_to_nanos),
                    event.pricing_version,
                    event.source,
                    event.epoch,
                    event.raw_fingerprint,
                    event.raw_json,
                ])?;
                if rows > 0 {
                    inserted += 1;
                }
            }
        }
        upsert_checkpoint_tx(&tx, checkpoint)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Dedup pre-check: which of the given ids are already stored. Purely
    /// advisory; `append_batch` still ignores duplicates on insert.
    pub fn existing_event_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let mut present = HashSet::new();
        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("SELECT id FROM usage_event WHERE id IN ({placeholders})");
            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                present.insert(row.get::<_, String>(0)?);
            }
        }
        Ok(present)
    }

    pub fn count_usage_events(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM usage_event", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn list_usage_events(
        &self,
        range: &TimeRange,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<UsageEvent>> {
        let mut sql = String::from(
            r#"
            SELECT id, occurred_at, occurred_at_inferred, provider, model,
                   input_units, output_units, cached_units, cost_nanos,
                   pricing_version, source, epoch, raw_fingerprint, raw_json
            FROM usage_event
            WHERE occurred_at >= ? AND occurred_at < ?
            "#,
        );
        let mut args: Vec<Value> = vec![range.start.clone().into(), range.end.clone().into()];
        if let Some(provider) = &filter.provider {
            sql.push_str(" AND provider = ?");
            args.push(provider.clone().into());
        }
        if let Some(model) = &filter.model {
            sql.push_str(" AND model = ?");
            args.push(model.clone().into());
        }
        sql.push_str(" ORDER BY occurred_at ASC, id ASC LIMIT ? OFFSET ?");
        args.push(i64::from(limit).into());
        args.push(i64::from(offset).into());

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(args))?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_usage_event(row)?);
        }
        Ok(events)
    }
}

fn row_to_usage_event(row: &Row<'_>) -> rusqlite::Result<UsageEvent> {
    Ok(UsageEvent {
        id: row.get(0)?,
        occurred_at: row.get(1)?,
        occurred_at_inferred: row.get(2)?,
        provider: row.get(3)?,
        model: row.get(4)?,
        units: UsageUnits {
            input_units: row.get::<_, i64>(5)? as u64,
            output_units: row.get::<_, i64>(6)? as u64,
            cached_units: row.get::<_, i64>(7)? as u64,
        },
        cost: row.get::<_, Option<i64>>(8)?.map(nanos_to_cost),
        pricing_version: row.get(9)?,
        source: row.get(10)?,
        epoch: row.get(11)?,
        raw_fingerprint: row.get(12)?,
        raw_json: row.get(13)?,
    })
}
