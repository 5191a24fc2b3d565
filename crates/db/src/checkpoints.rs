use rusqlite::{Transaction, params};

use crate::Db;
use crate::error::Result;
use crate::types::SourceCheckpoint;

pub(crate) fn upsert_checkpoint_tx(tx: &Transaction<'_>, cp: &SourceCheckpoint) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO source_checkpoint (
          source, byte_offset, epoch, head_len, head_hash, last_event_id, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(source) DO UPDATE SET
          byte_offset = excluded.byte_offset,
          epoch = excluded.epoch,
          head_len = excluded.head_len,
          head_hash = excluded.head_hash,
          last_event_id = excluded.last_event_id,
          updated_at = excluded.updated_at
        "#,
        params![
            cp.source,
            cp.byte_offset as i64,
            cp.epoch,
            cp.head_len as i64,
            cp.head_hash,
            cp.last_event_id,
            cp.updated_at,
        ],
    )?;
    Ok(())
}

impl Db {
    pub fn checkpoint(&self, source: &str) -> Result<Option<SourceCheckpoint>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT source, byte_offset, epoch, head_len, head_hash, last_event_id, updated_at
            FROM source_checkpoint
            WHERE source = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![source])?;
        if let Some(row) = rows.next()? {
            Ok(Some(SourceCheckpoint {
                source: row.get(0)?,
                byte_offset: row.get::<_, i64>(1)? as u64,
                epoch: row.get(2)?,
                head_len: row.get::<_, i64>(3)? as u64,
                head_hash: row.get(4)?,
                last_event_id: row.get(5)?,
                updated_at: row.get(6)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Used by the engine to reset a checkpoint after rotation, outside the
    /// normal append path.
    pub fn upsert_checkpoint(&mut self, cp: &SourceCheckpoint) -> Result<()> {
        let tx = self.conn.transaction()?;
        upsert_checkpoint_tx(&tx, cp)?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_checkpoints(&self) -> Result<Vec<SourceCheckpoint>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT source, byte_offset, epoch, head_len, head_hash, last_event_id, updated_at
            FROM source_checkpoint
            ORDER BY source ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SourceCheckpoint {
                source: row.get(0)?,
                byte_offset: row.get::<_, i64>(1)? as u64,
                epoch: row.get(2)?,
                head_len: row.get::<_, i64>(3)? as u64,
                head_hash: row.get(4)?,
                last_event_id: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}
