// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Multi-chain custody service.
//!
//! Flow: API and chain workers -> sequencer log -> replay -> ledger.
//! The log writer lane is the single source of order; the replay engine is the only
//! writer of the ledger.
pub mod api;
pub mod chain;
pub mod deposit;
pub mod replay;
pub mod sequencer_log;
pub mod stop;
pub mod storage;
pub mod tokens;
pub mod withdraw;

#[cfg(test)]
mod testing;
