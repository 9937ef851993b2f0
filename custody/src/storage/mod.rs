// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod ledger_db;
mod log_db;
mod sql;

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use rusqlite_migration::{M, Migrations};
use thiserror::Error;

pub use ledger_db::{LedgerDb, LedgerReader, OwnerFilter};
pub use log_db::{LogStorage, StoredBatch};

#[derive(Debug, Error)]
pub enum StorageOpenError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
}

pub(crate) fn open_connection(
    path: &str,
    synchronous: &str,
) -> Result<Connection, StorageOpenError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", synchronous)?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(conn)
}

pub(crate) fn open_with_migrations(
    path: &str,
    synchronous: &str,
    migrations: &[&'static str],
) -> Result<Connection, StorageOpenError> {
    let mut conn = open_connection(path, synchronous)?;
    let steps: Vec<M<'static>> = migrations.iter().map(|sql| M::up(sql)).collect();
    Migrations::new(steps).to_latest(&mut conn)?;
    Ok(conn)
}

/// SQLite integers are signed; values past `i64::MAX` fail the statement instead of being
/// clamped onto an existing key.
pub(crate) fn u64_to_i64(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
}

pub(crate) fn i64_to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

pub(crate) fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

#[derive(Debug, Error)]
pub enum StorageAccessError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage connection poisoned by a panicked task")]
    Poisoned,
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A synchronous storage handle shared by async tasks. Every access runs on the blocking
/// pool and holds the connection for the duration of the closure.
pub struct BlockingStorage<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for BlockingStorage<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Send + 'static> BlockingStorage<S> {
    pub fn new(storage: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(storage)),
        }
    }

    pub async fn run<T, F>(&self, f: F) -> Result<T, StorageAccessError>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> rusqlite::Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().map_err(|_| StorageAccessError::Poisoned)?;
            f(&mut *guard).map_err(StorageAccessError::from)
        })
        .await?
    }
}
