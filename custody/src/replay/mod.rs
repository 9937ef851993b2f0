// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Folds the sequencer log into the ledger.
//!
//! Exactly one engine runs per ledger database. It tails the log from the ledger's replay
//! cursor and applies each batch in one SQLite transaction together with the cursor
//! advance, so a restart resumes at the first batch whose effects were not committed.

use custody_core::{DecodedTransaction, decode_batch};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sequencer_log::{LogError, SequencerLog};
use crate::stop::StopSignal;
use crate::storage::LedgerDb;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("cannot read replay cursor")]
    Cursor {
        #[source]
        source: rusqlite::Error,
    },
    #[error("cannot read sequencer log")]
    Log {
        #[source]
        source: LogError,
    },
    #[error("cannot apply batch {index}")]
    Apply {
        index: u64,
        #[source]
        source: rusqlite::Error,
    },
}

pub struct ReplayEngine {
    log: SequencerLog,
    ledger: LedgerDb,
    stop: StopSignal,
}

impl ReplayEngine {
    pub fn new(log: SequencerLog, ledger: LedgerDb, stop: StopSignal) -> Self {
        Self { log, ledger, stop }
    }

    /// Runs the engine on a dedicated blocking thread until stopped or a storage error.
    pub fn spawn(self) -> JoinHandle<Result<(), ReplayError>> {
        tokio::task::spawn_blocking(move || {
            let mut engine = self;
            engine.run()
        })
    }

    fn run(&mut self) -> Result<(), ReplayError> {
        let from_index = self
            .ledger
            .next_index()
            .map_err(|source| ReplayError::Cursor { source })?;
        info!(from_index, "ledger replay starting");

        let tail = self
            .log
            .tail(from_index, self.stop.clone())
            .map_err(|source| ReplayError::Log { source })?;
        for item in tail {
            let batch = item.map_err(|source| ReplayError::Log { source })?;
            let txs = decode_or_empty(batch.index, &batch.payload);
            let applied = self
                .ledger
                .apply_batch(batch.index, &txs)
                .map_err(|source| ReplayError::Apply {
                    index: batch.index,
                    source,
                })?;

            match applied {
                Some(outcomes) => {
                    let ignored: usize = outcomes.iter().map(|o| o.ignored.len()).sum();
                    info!(
                        index = batch.index,
                        txs = txs.len(),
                        ignored,
                        "batch applied"
                    );
                }
                None => debug!(index = batch.index, "batch already applied"),
            }
            if self.stop.is_stop_requested() {
                break;
            }
        }

        info!("ledger replay stopped");
        Ok(())
    }
}

/// A payload that is not an array of envelopes still occupies its index: it is applied as
/// an empty batch so the cursor moves past it.
fn decode_or_empty(index: u64, payload: &str) -> Vec<DecodedTransaction> {
    match decode_batch(payload) {
        Ok(txs) => txs,
        Err(err) => {
            warn!(index, error = %err, "undecodable batch skipped");
            Vec::new()
        }
    }
}
