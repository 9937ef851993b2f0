// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use custody_core::ChainId;
use rusqlite::{Connection, Result, TransactionBehavior};

use super::sql::{
    sql_insert_batch, sql_select_batch_index_by_correlation, sql_select_batches_from,
    sql_select_next_batch_index, sql_select_scan_cursor, sql_upsert_scan_cursor,
};
use super::{StorageOpenError, i64_to_u64, now_unix_ms, open_with_migrations, u64_to_i64};

const MIGRATION_0001_SCHEMA: &str = include_str!("migrations/log/0001_schema.sql");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBatch {
    pub index: u64,
    pub correlation_id: String,
    pub payload: String,
}

/// SQLite backend of the sequencer log. Only the log writer lane appends; any number of
/// tails and lookups may read concurrently (WAL).
pub struct LogStorage {
    conn: Connection,
}

impl LogStorage {
    pub fn open(path: &str, synchronous: &str) -> std::result::Result<Self, StorageOpenError> {
        let conn = open_with_migrations(path, synchronous, &[MIGRATION_0001_SCHEMA])?;
        Ok(Self { conn })
    }

    /// Appends entries in order, all in one write transaction, and returns their indices.
    /// An entry whose correlation id is already in the log is not appended again; its
    /// original index is returned instead.
    pub fn append_batches(&mut self, entries: &[(&str, &str)]) -> Result<Vec<u64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut next_index = sql_select_next_batch_index(&tx)?;
        let appended_at_ms = now_unix_ms();
        let mut indices = Vec::with_capacity(entries.len());

        for (correlation_id, payload) in entries {
            if let Some(existing) = sql_select_batch_index_by_correlation(&tx, correlation_id)? {
                indices.push(i64_to_u64(existing));
                continue;
            }
            sql_insert_batch(&tx, next_index, correlation_id, payload, appended_at_ms)?;
            indices.push(i64_to_u64(next_index));
            next_index = next_index.saturating_add(1);
        }

        tx.commit()?;
        Ok(indices)
    }

    /// Number of batches in the log, i.e. the index the next append will receive.
    pub fn next_index(&self) -> Result<u64> {
        Ok(i64_to_u64(sql_select_next_batch_index(&self.conn)?))
    }

    pub fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<u64>> {
        Ok(sql_select_batch_index_by_correlation(&self.conn, correlation_id)?.map(i64_to_u64))
    }

    /// Loads up to `limit` batches starting at `from_inclusive`, in index order.
    pub fn load_batches_from(&self, from_inclusive: u64, limit: usize) -> Result<Vec<StoredBatch>> {
        let rows = sql_select_batches_from(
            &self.conn,
            u64_to_i64(from_inclusive)?,
            u64_to_i64(limit as u64)?,
        )?;

        let mut out = Vec::with_capacity(rows.len());
        for (offset, row) in rows.into_iter().enumerate() {
            let index = i64_to_u64(row.batch_index);
            let expected = from_inclusive.saturating_add(offset as u64);
            assert_eq!(
                index, expected,
                "non-contiguous log index: expected {expected}, found {index}"
            );
            out.push(StoredBatch {
                index,
                correlation_id: row.correlation_id,
                payload: row.payload,
            });
        }
        Ok(out)
    }

    pub fn scan_cursor(&self, chain: ChainId) -> Result<Option<u64>> {
        Ok(sql_select_scan_cursor(&self.conn, chain)?.map(i64_to_u64))
    }

    pub fn set_scan_cursor(&mut self, chain: ChainId, height: u64) -> Result<()> {
        sql_upsert_scan_cursor(&self.conn, chain, u64_to_i64(height)?)
    }
}
