// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Append-only, totally ordered log of transaction batches.
//!
//! Producers hand batches to the single [`LogWriter`] lane through a bounded queue; the
//! lane assigns dense indices from 0. Every batch carries a correlation id that the lane
//! echoes back with the assigned index, so a producer learns exactly which index is its
//! own even when two producers append identical batches.

mod error;
mod tail;
mod types;
mod writer;

use std::time::Duration;

use alloy_primitives::hex;
use custody_core::{Transaction, encode_batch};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::stop::StopSignal;
use crate::storage::{BlockingStorage, LogStorage, StorageOpenError};

pub use error::LogWriterError;
pub use tail::LogTail;
pub use types::{LogError, PendingBatch};
pub use writer::{LogWriter, LogWriterConfig, LogWriterStop};

#[derive(Debug, Clone, Copy)]
pub struct SequencerLogConfig {
    pub queue_capacity: usize,
    pub queue_timeout: Duration,
    pub poll_interval: Duration,
    pub page_size: usize,
    pub writer: LogWriterConfig,
}

/// Cloneable producer/consumer handle of the log.
#[derive(Clone)]
pub struct SequencerLog {
    sender: mpsc::Sender<PendingBatch>,
    reader: BlockingStorage<LogStorage>,
    db_path: String,
    synchronous: String,
    config: SequencerLogConfig,
}

/// An enqueued batch. Its index is known once the writer acknowledges it.
#[derive(Debug)]
pub struct AppendHandle {
    correlation_id: String,
    ack: oneshot::Receiver<Result<u64, LogError>>,
}

impl AppendHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl SequencerLog {
    /// Opens the log at `db_path` and spawns its writer lane.
    pub fn start(
        db_path: &str,
        synchronous: &str,
        config: SequencerLogConfig,
    ) -> Result<(Self, JoinHandle<LogWriterError>, LogWriterStop), StorageOpenError> {
        let writer_storage = LogStorage::open(db_path, synchronous)?;
        let reader_storage = LogStorage::open(db_path, synchronous)?;
        let (sender, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (handle, stop) = LogWriter::new(rx, writer_storage, config.writer).spawn();
        let log = Self {
            sender,
            reader: BlockingStorage::new(reader_storage),
            db_path: db_path.to_string(),
            synchronous: synchronous.to_string(),
            config,
        };
        Ok((log, handle, stop))
    }

    /// Enqueues a batch under a fresh correlation id. Does not wait for an index.
    pub async fn append(&self, txs: &[Transaction]) -> Result<AppendHandle, LogError> {
        self.append_with_correlation(new_correlation_id(), txs)
            .await
    }

    /// Enqueues a batch under a caller-chosen correlation id. Re-appending an id that is
    /// already in the log yields the original index and does not add a new batch.
    pub async fn append_with_correlation(
        &self,
        correlation_id: String,
        txs: &[Transaction],
    ) -> Result<AppendHandle, LogError> {
        let payload = encode_batch(txs).map_err(|source| LogError::Encode { source })?;
        let (respond_to, ack) = oneshot::channel();
        let pending = PendingBatch {
            correlation_id: correlation_id.clone(),
            payload,
            respond_to,
        };

        match self
            .sender
            .send_timeout(pending, self.config.queue_timeout)
            .await
        {
            Ok(()) => Ok(AppendHandle {
                correlation_id,
                ack,
            }),
            Err(SendTimeoutError::Timeout(_)) => Err(LogError::Overloaded),
            Err(SendTimeoutError::Closed(_)) => Err(LogError::WriterUnavailable),
        }
    }

    /// Appends and waits until the batch is visible in the log, returning its index.
    pub async fn append_and_confirm(
        &self,
        txs: &[Transaction],
        timeout: Duration,
    ) -> Result<u64, LogError> {
        self.append_and_confirm_with_correlation(new_correlation_id(), txs, timeout)
            .await
    }

    /// [`SequencerLog::append_and_confirm`] under a caller-chosen correlation id. After a
    /// [`LogError::Timeout`] the caller retries with the same id: a batch that landed in
    /// the meantime resolves to its original index instead of being appended twice.
    pub async fn append_and_confirm_with_correlation(
        &self,
        correlation_id: String,
        txs: &[Transaction],
        timeout: Duration,
    ) -> Result<u64, LogError> {
        let handle = self.append_with_correlation(correlation_id, txs).await?;
        self.confirm(handle, timeout).await
    }

    async fn confirm(&self, handle: AppendHandle, timeout: Duration) -> Result<u64, LogError> {
        let correlation_id = handle.correlation_id.clone();
        match tokio::time::timeout(timeout, self.wait_visible(handle)).await {
            Ok(result) => result,
            Err(_) => Err(LogError::Timeout {
                correlation_id,
                timeout,
            }),
        }
    }

    /// Prefers the writer's ack; if the ack is lost the log itself is polled for the
    /// correlation id. Unbounded on its own, only reached through [`Self::confirm`].
    async fn wait_visible(&self, handle: AppendHandle) -> Result<u64, LogError> {
        let AppendHandle {
            correlation_id,
            ack,
        } = handle;
        if let Ok(result) = ack.await {
            return result;
        }

        warn!(%correlation_id, "log writer dropped ack, polling log");
        loop {
            if let Some(index) = self.find_by_correlation(&correlation_id).await? {
                return Ok(index);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    pub async fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<u64>, LogError> {
        let correlation_id = correlation_id.to_string();
        let found = self
            .reader
            .run(move |storage| storage.find_by_correlation(&correlation_id))
            .await?;
        Ok(found)
    }

    /// Number of batches currently in the log.
    pub async fn head(&self) -> Result<u64, LogError> {
        Ok(self.reader.run(|storage| storage.next_index()).await?)
    }

    /// Opens a blocking tail starting at `from_index`. Meant for a dedicated thread.
    pub fn tail(&self, from_index: u64, stop: StopSignal) -> Result<LogTail, LogError> {
        let storage = LogStorage::open(&self.db_path, &self.synchronous)
            .map_err(|source| LogError::Open { source })?;
        debug!(from_index, "opening log tail");
        Ok(LogTail::new(
            storage,
            from_index,
            self.config.page_size,
            self.config.poll_interval,
            stop,
        ))
    }

    /// Storage handle for the per-chain scan cursors kept next to the log.
    pub fn cursor_storage(&self) -> BlockingStorage<LogStorage> {
        self.reader.clone()
    }
}

pub fn new_correlation_id() -> String {
    hex::encode_prefixed(rand::random::<[u8; 16]>())
}
