use chrono::Utc;
use ledger_core::format_ts;
use rusqlite::params;
use rust_decimal::Decimal;

use crate::Db;
use crate::error::Result;

/// Per-rule ratchet: the highest threshold fraction already fired within
/// the current period. Reset happens implicitly when `period_start` moves.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertState {
    pub rule_id: String,
    pub period_start: String,
    pub highest_fired: Option<Decimal>,
    pub updated_at: String,
}

impl Db {
    pub fn alert_state(&self, rule_id: &str) -> Result<Option<AlertState>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT rule_id, period_start, highest_fired, updated_at
            FROM alert_state
            WHERE rule_id = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![rule_id])?;
        if let Some(row) = rows.next()? {
            let fraction: Option<String> = row.get(2)?;
            Ok(Some(AlertState {
                rule_id: row.get(0)?,
                period_start: row.get(1)?,
                highest_fired: match fraction {
                    Some(raw) => Some(raw.parse::<Decimal>()?),
                    None => None,
                },
                updated_at: row.get(3)?,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn record_alert(
        &self,
        rule_id: &str,
        period_start: &str,
        fraction: Decimal,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO alert_state (rule_id, period_start, highest_fired, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(rule_id) DO UPDATE SET
              period_start = excluded.period_start,
              highest_fired = excluded.highest_fired,
              updated_at = excluded.updated_at
            "#,
            params![
                rule_id,
                period_start,
                fraction.to_string(),
                format_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }
}
