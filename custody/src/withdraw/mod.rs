// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod key;
mod orchestrator;
mod signing;

use thiserror::Error;

use crate::sequencer_log::LogError;
use crate::storage::StorageAccessError;

pub use key::{DistKeyConfig, KeyConfigError};
pub use orchestrator::{WithdrawOrchestrator, WithdrawOrchestratorConfig, withdraw_confirm_message};
pub use signing::{HttpSigningService, NoncePool, NonceRound, SigningError, SigningService};

/// Identifier of a signing node as listed in the key's party.
pub type NodeId = String;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("cannot read ledger")]
    Ledger {
        #[source]
        source: StorageAccessError,
    },
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("nonce pool exhausted before every withdraw was signed")]
    NoncesExhausted,
    #[error("cannot append approvals")]
    Log {
        #[source]
        source: LogError,
    },
}
