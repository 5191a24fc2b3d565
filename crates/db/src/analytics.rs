use ledger_core::{TimeRange, nanos_to_cost};
use rusqlite::{Row, params, params_from_iter, types::Value};

use crate::Db;
use crate::error::Result;
use crate::types::{Bucket, EventFilter, ModelSpend, ProviderSpend, SpendPoint, SpendSummary};

const SUM_COLUMNS: &str = r#"
  COALESCE(SUM(input_units), 0),
  COALESCE(SUM(output_units), 0),
  COALESCE(SUM(cached_units), 0),
  COALESCE(SUM(cost_nanos), 0),
  COUNT(cost_nanos),
  COALESCE(SUM(CASE WHEN cost_nanos IS NULL THEN 1 ELSE 0 END), 0)
"#;

fn range_clause(range: &TimeRange, filter: &EventFilter) -> (String, Vec<Value>) {
    let mut clause = String::from("occurred_at >= ? AND occurred_at < ?");
    let mut args: Vec<Value> = vec![range.start.clone().into(), range.end.clone().into()];
    if let Some(provider) = &filter.provider {
        clause.push_str(" AND provider = ?");
        args.push(provider.clone().into());
    }
    if let Some(model) = &filter.model {
        clause.push_str(" AND model = ?");
        args.push(model.clone().into());
    }
    (clause, args)
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SpendSummary> {
    Ok(SpendSummary {
        input_units: row.get::<_, i64>(0)?.max(0) as u64,
        output_units: row.get::<_, i64>(1)?.max(0) as u64,
        cached_units: row.get::<_, i64>(2)?.max(0) as u64,
        cost: nanos_to_cost(row.get::<_, i64>(3)?),
        priced_events: row.get::<_, i64>(4)?.max(0) as u64,
        unpriced_events: row.get::<_, i64>(5)?.max(0) as u64,
    })
}

impl Db {
    /// Aggregate spend over a range, computed entirely in SQL so memory
    /// stays bounded regardless of history size.
    pub fn spend_summary(&self, range: &TimeRange, filter: &EventFilter) -> Result<SpendSummary> {
        let (clause, args) = range_clause(range, filter);
        let sql = format!("SELECT {SUM_COLUMNS} FROM usage_event WHERE {clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        Ok(stmt.query_row(params_from_iter(args), summary_from_row)?)
    }

    pub fn spend_by_provider(&self, range: &TimeRange) -> Result<Vec<ProviderSpend>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT provider,
                   COALESCE(SUM(input_units + output_units), 0),
                   COALESCE(SUM(cost_nanos), 0),
                   COALESCE(SUM(CASE WHEN cost_nanos IS NULL THEN 1 ELSE 0 END), 0)
            FROM usage_event
            WHERE occurred_at >= ?1 AND occurred_at < ?2
            GROUP BY provider
            ORDER BY 3 DESC, provider ASC
            "#,
        )?;
        let rows = stmt.query_map(params![range.start, range.end], |row| {
            Ok(ProviderSpend {
                provider: row.get(0)?,
                total_units: row.get::<_, i64>(1)?.max(0) as u64,
                cost: nanos_to_cost(row.get::<_, i64>(2)?),
                unpriced_events: row.get::<_, i64>(3)?.max(0) as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn spend_by_model(&self, range: &TimeRange) -> Result<Vec<ModelSpend>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT provider, model,
                   COALESCE(SUM(input_units + output_units), 0),
                   COALESCE(SUM(cost_nanos), 0),
                   COALESCE(SUM(CASE WHEN cost_nanos IS NULL THEN 1 ELSE 0 END), 0)
            FROM usage_event
            WHERE occurred_at >= ?1 AND occurred_at < ?2
            GROUP BY provider, model
            ORDER BY 4 DESC, provider ASC, model ASC
            "#,
        )?;
        let rows = stmt.query_map(params![range.start, range.end], |row| {
            Ok(ModelSpend {
                provider: row.get(0)?,
                model: row.get(1)?,
                total_units: row.get::<_, i64>(2)?.max(0) as u64,
                cost: nanos_to_cost(row.get::<_, i64>(3)?),
                unpriced_events: row.get::<_, i64>(4)?.max(0) as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Spend bucketed on the event clock (`occurred_at`), not ingestion
    /// time, so late-arriving records land in their true bucket.
    pub fn spend_timeseries(&self, range: &TimeRange, bucket: Bucket) -> Result<Vec<SpendPoint>> {
        // RFC3339 UTC sorts lexicographically; a prefix is a bucket key.
        let prefix_len = match bucket {
            Bucket::Day => 10,
            Bucket::Hour => 13,
        };
        let mut stmt = self.conn.prepare(
            r#"
            SELECT substr(occurred_at, 1, ?1),
                   COALESCE(SUM(input_units + output_units), 0),
                   COALESCE(SUM(cost_nanos), 0)
            FROM usage_event
            WHERE occurred_at >= ?2 AND occurred_at < ?3
            GROUP BY 1
            ORDER BY 1 ASC
            "#,
        )?;
        let rows = stmt.query_map(params![prefix_len, range.start, range.end], |row| {
            Ok(SpendPoint {
                bucket_start: row.get(0)?,
                total_units: row.get::<_, i64>(1)?.max(0) as u64,
                cost: nanos_to_cost(row.get::<_, i64>(2)?),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}
