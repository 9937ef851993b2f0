// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Chain adapters consumed by the deposit workers.

mod derivation;
#[cfg(test)]
pub(crate) mod mock;
mod solana;
mod transfers;

use std::collections::HashMap;

use async_trait::async_trait;
use custody_core::{ChainId, Deposit, DepositAddress, DepositToken};
use thiserror::Error;

pub use derivation::{
    AddressDeriver, DerivationError, DerivedAddress, solana_deposit_address, ton_deposit_address,
};
pub use solana::{RpcBlock, RpcConfirmedTransaction, SolanaRpcClient, SolanaRpcConfig};
pub use transfers::{block_transfers, deposit_matches_transaction};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("{method} request failed")]
    Transport {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} returned error {code}: {message}")]
    Rpc {
        method: &'static str,
        code: i64,
        message: String,
    },
    #[error("malformed {method} response: {reason}")]
    Malformed {
        method: &'static str,
        reason: String,
    },
}

/// A credit into a watched address, seen in a finalized block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedTransfer {
    pub tx_hash: String,
    pub block: u64,
    pub address: String,
    pub memo: Option<String>,
    pub token: DepositToken,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain(&self) -> ChainId;

    async fn finalized_height(&self) -> Result<u64, ChainError>;

    /// Transfers into any address of `watched` within the block at `height`. Skipped or
    /// empty slots yield no transfers.
    async fn block_transfers(
        &self,
        height: u64,
        watched: &AddressBook,
    ) -> Result<Vec<ObservedTransfer>, ChainError>;

    /// Re-fetches the deposit's transaction and checks it still pays the recorded token and
    /// amount into the recorded address.
    async fn verify_deposit(&self, deposit: &Deposit) -> Result<bool, ChainError>;
}

/// Active deposit addresses of one chain, indexed by address string.
///
/// Memo-addressed chains register many slots under one address; a transfer resolves to
/// the slot whose memo equals the transfer's memo. A slot registered with a memo never
/// matches a transfer without one, and the other way round.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    by_address: HashMap<String, Vec<DepositAddress>>,
}

impl AddressBook {
    pub fn new(addresses: impl IntoIterator<Item = DepositAddress>) -> Self {
        let mut by_address: HashMap<String, Vec<DepositAddress>> = HashMap::new();
        for address in addresses.into_iter().filter(|address| address.active) {
            by_address
                .entry(address.address.clone())
                .or_default()
                .push(address);
        }
        Self { by_address }
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_address.values().map(Vec::len).sum()
    }

    pub fn is_watched(&self, address: &str) -> bool {
        self.by_address.contains_key(address)
    }

    pub fn resolve(&self, address: &str, memo: Option<&str>) -> Option<&DepositAddress> {
        self.by_address
            .get(address)?
            .iter()
            .find(|slot| slot.memo.as_deref() == memo)
    }
}
