// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{LogError, LogWriterError, PendingBatch};
use crate::storage::LogStorage;

#[derive(Debug, Clone, Copy)]
pub struct LogWriterConfig {
    pub max_batches_per_chunk: usize,
    pub idle_poll_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct LogWriterStop {
    shutdown: Arc<AtomicBool>,
}

impl LogWriterStop {
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Single writer of the sequencer log. Defines the global order: batches are indexed in
/// the order the lane dequeues them, and each producer is answered only after the chunk
/// holding its batch is committed.
pub struct LogWriter {
    rx: mpsc::Receiver<PendingBatch>,
    stop: LogWriterStop,
    storage: LogStorage,
    config: LogWriterConfig,
}

impl LogWriter {
    pub fn new(
        rx: mpsc::Receiver<PendingBatch>,
        storage: LogStorage,
        config: LogWriterConfig,
    ) -> Self {
        Self {
            rx,
            stop: LogWriterStop::default(),
            storage,
            config,
        }
    }

    pub fn spawn(self) -> (JoinHandle<LogWriterError>, LogWriterStop) {
        let stop = self.stop.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut writer = self;
            match writer.run_forever() {
                Err(err) => err,
                Ok(()) => unreachable!("log writer run loop is expected to be non-terminating"),
            }
        });
        (handle, stop)
    }

    fn run_forever(&mut self) -> Result<(), LogWriterError> {
        let max_chunk = self.config.max_batches_per_chunk.max(1);
        let mut chunk = Vec::with_capacity(max_chunk);

        while !self.stop.is_shutdown_requested() {
            dequeue_chunk(&mut self.rx, max_chunk, &mut chunk)?;
            if chunk.is_empty() {
                thread::sleep(self.config.idle_poll_interval);
                continue;
            }
            self.persist_chunk(&mut chunk)?;
        }

        Err(LogWriterError::ShutdownRequested)
    }

    fn persist_chunk(&mut self, chunk: &mut Vec<PendingBatch>) -> Result<(), LogWriterError> {
        let appended = {
            let entries: Vec<(&str, &str)> = chunk
                .iter()
                .map(|item| (item.correlation_id.as_str(), item.payload.as_str()))
                .collect();
            self.storage.append_batches(&entries)
        };

        match appended {
            Ok(indices) => {
                debug!(count = indices.len(), "log batches committed");
                for (item, index) in chunk.drain(..).zip(indices) {
                    let _ = item.respond_to.send(Ok(index));
                }
                Ok(())
            }
            Err(source) => {
                respond_error_to_all(chunk, format!("db error: {source}"));
                Err(LogWriterError::AppendBatches { source })
            }
        }
    }
}

fn respond_error_to_all(pending: &mut Vec<PendingBatch>, message: String) {
    for item in pending.drain(..) {
        let _ = item.respond_to.send(Err(LogError::Append(message.clone())));
    }
}

fn dequeue_chunk(
    rx: &mut mpsc::Receiver<PendingBatch>,
    max_chunk: usize,
    chunk: &mut Vec<PendingBatch>,
) -> Result<(), LogWriterError> {
    while chunk.len() < max_chunk {
        match rx.try_recv() {
            Ok(item) => chunk.push(item),
            Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                if chunk.is_empty() {
                    return Err(LogWriterError::ChannelClosed);
                }
                return Ok(());
            }
        }
    }
    Ok(())
}
