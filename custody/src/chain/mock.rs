// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use custody_core::{ChainId, Deposit};

use super::{AddressBook, ChainClient, ChainError, ObservedTransfer};

/// Scripted chain for worker tests.
#[derive(Default)]
pub(crate) struct MockChain {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    finalized: u64,
    blocks: HashMap<u64, Vec<ObservedTransfer>>,
    failing_blocks: HashSet<u64>,
    valid_txs: HashSet<String>,
    scanned: Vec<u64>,
    verified: Vec<String>,
}

impl MockChain {
    pub fn set_finalized(&self, height: u64) {
        self.lock().finalized = height;
    }

    pub fn add_transfer(&self, transfer: ObservedTransfer) {
        self.lock()
            .blocks
            .entry(transfer.block)
            .or_default()
            .push(transfer);
    }

    pub fn fail_block(&self, height: u64, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing_blocks.insert(height);
        } else {
            state.failing_blocks.remove(&height);
        }
    }

    pub fn mark_valid(&self, tx_hash: &str) {
        self.lock().valid_txs.insert(tx_hash.to_string());
    }

    pub fn scanned(&self) -> Vec<u64> {
        let mut scanned = self.lock().scanned.clone();
        scanned.sort_unstable();
        scanned
    }

    pub fn verified(&self) -> Vec<String> {
        self.lock().verified.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock chain lock")
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn chain(&self) -> ChainId {
        ChainId::Solana
    }

    async fn finalized_height(&self) -> Result<u64, ChainError> {
        Ok(self.lock().finalized)
    }

    async fn block_transfers(
        &self,
        height: u64,
        watched: &AddressBook,
    ) -> Result<Vec<ObservedTransfer>, ChainError> {
        let mut state = self.lock();
        state.scanned.push(height);
        if state.failing_blocks.contains(&height) {
            return Err(ChainError::Malformed {
                method: "getBlock",
                reason: format!("block {height} unavailable"),
            });
        }
        Ok(state
            .blocks
            .get(&height)
            .into_iter()
            .flatten()
            .filter(|transfer| watched.is_watched(&transfer.address))
            .cloned()
            .collect())
    }

    async fn verify_deposit(&self, deposit: &Deposit) -> Result<bool, ChainError> {
        let mut state = self.lock();
        state.verified.push(deposit.tx_hash.clone());
        Ok(state.valid_txs.contains(&deposit.tx_hash))
    }
}
