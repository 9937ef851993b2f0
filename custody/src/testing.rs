// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! In-process log + replay pair over temporary SQLite files, for unit tests.

use std::time::Duration;

use custody_core::Transaction;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::replay::{ReplayEngine, ReplayError};
use crate::sequencer_log::{LogWriterConfig, LogWriterStop, SequencerLog, SequencerLogConfig};
use crate::stop::StopSignal;
use crate::storage::{BlockingStorage, LedgerDb, LedgerReader};

pub(crate) struct TestNode {
    _dir: TempDir,
    pub log: SequencerLog,
    pub ledger: BlockingStorage<LedgerReader>,
    writer_stop: LogWriterStop,
    replay_stop: StopSignal,
    replay: Option<JoinHandle<Result<(), ReplayError>>>,
}

pub(crate) fn test_log_config() -> SequencerLogConfig {
    SequencerLogConfig {
        queue_capacity: 64,
        queue_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(5),
        page_size: 16,
        writer: LogWriterConfig {
            max_batches_per_chunk: 16,
            idle_poll_interval: Duration::from_millis(2),
        },
    }
}

impl TestNode {
    pub async fn start() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let log_path = dir.path().join("log.sqlite").to_string_lossy().into_owned();
        let ledger_path = dir
            .path()
            .join("ledger.sqlite")
            .to_string_lossy()
            .into_owned();

        let (log, _writer, writer_stop) =
            SequencerLog::start(&log_path, "NORMAL", test_log_config()).expect("start log");
        let replay_stop = StopSignal::new();
        let ledger_db = LedgerDb::open(&ledger_path, "NORMAL").expect("open ledger");
        let replay = ReplayEngine::new(log.clone(), ledger_db, replay_stop.clone()).spawn();
        let reader = LedgerReader::open(&ledger_path, "NORMAL").expect("open reader");

        Self {
            _dir: dir,
            log,
            ledger: BlockingStorage::new(reader),
            writer_stop,
            replay_stop,
            replay: Some(replay),
        }
    }

    /// Stops replay and waits for the engine to exit; later batches stay unapplied.
    pub async fn stop_replay(&mut self) {
        self.replay_stop.request_stop();
        if let Some(replay) = self.replay.take() {
            replay
                .await
                .expect("join replay")
                .expect("replay stopped cleanly");
        }
    }

    /// Appends one batch and waits until replay has applied it.
    pub async fn append(&self, txs: &[Transaction]) -> u64 {
        let index = self
            .log
            .append_and_confirm(txs, Duration::from_secs(2))
            .await
            .expect("append batch");
        self.wait_for_replay(index).await;
        index
    }

    /// Waits until every batch up to and including `index` is applied.
    pub async fn wait_for_replay(&self, index: u64) {
        for _ in 0..400 {
            let next = self
                .ledger
                .run(|reader| reader.next_index())
                .await
                .expect("read cursor");
            if next > index {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("replay did not reach batch {index}");
    }

    /// Waits until replay has caught up with the head of the log.
    pub async fn settle(&self) {
        let head = self.log.head().await.expect("log head");
        if head > 0 {
            self.wait_for_replay(head - 1).await;
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.replay_stop.request_stop();
        self.writer_stop.request_shutdown();
    }
}
