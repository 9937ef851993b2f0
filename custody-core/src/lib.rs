// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Custody ledger domain.
//!
//! The ledger is a pure fold over the sequencer log: every transaction is applied by a
//! deterministic, idempotent handler that only sees the current ledger state and the
//! transaction payload. Storage is abstracted behind [`ledger::LedgerStore`].
pub mod entities;
pub mod ledger;
pub mod transaction;

pub use entities::{
    AddressSlot, Agent, AvsSignature, ChainId, Deposit, DepositAddress, DepositToken, TokenInfo,
    UnknownChain, Withdraw, WithdrawStatus, derive_agent_id,
};
pub use ledger::{
    ApplyOutcome, IgnoreReason, InsertOutcome, LedgerSnapshot, LedgerStore, MAX_LEDGER_INTEGER,
    MemoryLedger, TxPosition, apply_transaction, replay_batch,
};
pub use transaction::{DecodedTransaction, Transaction, decode_batch, encode_batch};
