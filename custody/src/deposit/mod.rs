// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Per-chain deposit workers. Both only append to the log; the ledger changes when
//! replay applies what they appended.

mod confirmer;
mod watcher;

use thiserror::Error;

use crate::chain::ChainError;
use crate::sequencer_log::LogError;
use crate::storage::StorageAccessError;

pub use confirmer::{DepositConfirmer, DepositConfirmerConfig};
pub use watcher::{DepositWatcher, DepositWatcherConfig};

/// Failure of one worker cycle. Never fatal: the worker logs it and retries next cycle.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("cannot read ledger")]
    Ledger {
        #[source]
        source: StorageAccessError,
    },
    #[error("cannot access scan cursor")]
    Cursor {
        #[source]
        source: StorageAccessError,
    },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("cannot append to log")]
    Log {
        #[source]
        source: LogError,
    },
}
