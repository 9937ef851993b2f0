// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use custody_core::transaction::DepositPayload;
use custody_core::{ChainId, Transaction};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::WatcherError;
use crate::chain::{AddressBook, ChainClient, ChainError, ObservedTransfer};
use crate::sequencer_log::SequencerLog;
use crate::stop::StopSignal;
use crate::storage::{BlockingStorage, LedgerReader, LogStorage};

#[derive(Debug, Clone, Copy)]
pub struct DepositWatcherConfig {
    pub poll_interval: Duration,
    pub max_parallel_blocks: usize,
    pub max_blocks_per_cycle: u64,
    /// First height to scan when no cursor is stored. Without it a fresh watcher starts
    /// at the current finalized height.
    pub start_height: Option<u64>,
    pub confirm_timeout: Duration,
}

/// Scans finalized blocks for transfers into active deposit addresses and appends one
/// `Deposit` per transaction. The scan cursor only moves past a block once every block
/// below it was scanned and its deposits are in the log.
pub struct DepositWatcher {
    client: Arc<dyn ChainClient>,
    log: SequencerLog,
    ledger: BlockingStorage<LedgerReader>,
    cursors: BlockingStorage<LogStorage>,
    config: DepositWatcherConfig,
    stop: StopSignal,
}

impl DepositWatcher {
    pub fn new(
        client: Arc<dyn ChainClient>,
        log: SequencerLog,
        ledger: BlockingStorage<LedgerReader>,
        config: DepositWatcherConfig,
        stop: StopSignal,
    ) -> Self {
        let cursors = log.cursor_storage();
        Self {
            client,
            log,
            ledger,
            cursors,
            config,
            stop,
        }
    }

    pub async fn run(self) {
        let chain = self.client.chain();
        info!(%chain, "deposit watcher started");
        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(count) => info!(%chain, count, "deposits appended"),
                Err(err) => warn!(%chain, error = %err, "deposit watcher cycle failed"),
            }
            if !self.stop.sleep(self.config.poll_interval).await {
                break;
            }
        }
        info!(%chain, "deposit watcher stopped");
    }

    /// One scan cycle. Returns the number of deposits appended.
    pub async fn poll_once(&self) -> Result<usize, WatcherError> {
        let chain = self.client.chain();
        let addresses = self
            .ledger
            .run(move |reader| reader.active_deposit_addresses(chain))
            .await
            .map_err(|source| WatcherError::Ledger { source })?;
        let book = AddressBook::new(addresses);

        let finalized = self.client.finalized_height().await?;
        let Some(from) = self.first_unscanned(chain, finalized).await? else {
            return Ok(0);
        };
        if from > finalized {
            return Ok(0);
        }
        let to = finalized.min(
            from.saturating_add(self.config.max_blocks_per_cycle.max(1))
                .saturating_sub(1),
        );

        let (scanned_to, transfers) = if book.is_empty() {
            (Some(to), Vec::new())
        } else {
            self.scan(from, to, &book).await
        };
        let Some(scanned_to) = scanned_to else {
            return Ok(0);
        };

        let txs = deposit_transactions(chain, &book, transfers);
        if !txs.is_empty() {
            let index = self
                .log
                .append_and_confirm(&txs, self.config.confirm_timeout)
                .await
                .map_err(|source| WatcherError::Log { source })?;
            debug!(%chain, index, count = txs.len(), "deposit batch visible");
        }

        self.store_cursor(chain, scanned_to).await?;
        debug!(%chain, from, to = scanned_to, watched = book.len(), "blocks scanned");
        Ok(txs.len())
    }

    async fn first_unscanned(
        &self,
        chain: ChainId,
        finalized: u64,
    ) -> Result<Option<u64>, WatcherError> {
        let cursor = self
            .cursors
            .run(move |storage| storage.scan_cursor(chain))
            .await
            .map_err(|source| WatcherError::Cursor { source })?;
        match (cursor, self.config.start_height) {
            (Some(last), _) => Ok(Some(last.saturating_add(1))),
            (None, Some(start)) => Ok(Some(start)),
            (None, None) => {
                info!(%chain, height = finalized, "no scan cursor, starting at finalized head");
                self.store_cursor(chain, finalized).await?;
                Ok(None)
            }
        }
    }

    /// Scans `from..=to` with bounded fan-out. Returns the highest height below which every
    /// block succeeded, with the transfers of those blocks only.
    async fn scan(
        &self,
        from: u64,
        to: u64,
        book: &AddressBook,
    ) -> (Option<u64>, Vec<ObservedTransfer>) {
        let client = &self.client;
        let mut results: Vec<(u64, Result<Vec<ObservedTransfer>, ChainError>)> =
            stream::iter(from..=to)
                .map(|height| async move { (height, client.block_transfers(height, book).await) })
                .buffer_unordered(self.config.max_parallel_blocks.max(1))
                .collect()
                .await;
        results.sort_unstable_by_key(|(height, _)| *height);

        let mut scanned_to = None;
        let mut transfers = Vec::new();
        for (height, result) in results {
            match result {
                Ok(found) => {
                    transfers.extend(found);
                    scanned_to = Some(height);
                }
                Err(err) => {
                    warn!(chain = %self.client.chain(), height, error = %err, "block scan failed");
                    break;
                }
            }
        }
        (scanned_to, transfers)
    }

    async fn store_cursor(&self, chain: ChainId, height: u64) -> Result<(), WatcherError> {
        self.cursors
            .run(move |storage| storage.set_scan_cursor(chain, height))
            .await
            .map_err(|source| WatcherError::Cursor { source })
    }
}

/// Deposits are keyed by transaction hash, so a transaction crediting several deposit
/// slots records only its first credit; the rest are reported and dropped here.
fn deposit_transactions(
    chain: ChainId,
    book: &AddressBook,
    transfers: Vec<ObservedTransfer>,
) -> Vec<Transaction> {
    let mut recorded: HashMap<String, String> = HashMap::new();
    let mut txs = Vec::new();
    for transfer in transfers {
        if let Some(kept) = recorded.get(&transfer.tx_hash) {
            warn!(
                %chain,
                tx_hash = %transfer.tx_hash,
                kept = %kept,
                dropped = %transfer.address,
                symbol = %transfer.token.symbol,
                amount = %transfer.token.amount,
                "transaction credits several deposit slots, only the first is recorded"
            );
            continue;
        }
        let tx_hash = transfer.tx_hash.clone();
        let address = transfer.address.clone();
        if let Some(tx) = deposit_transaction(chain, book, transfer) {
            recorded.insert(tx_hash, address);
            txs.push(tx);
        }
    }
    txs
}

fn deposit_transaction(
    chain: ChainId,
    book: &AddressBook,
    transfer: ObservedTransfer,
) -> Option<Transaction> {
    let Some(slot) = book.resolve(&transfer.address, transfer.memo.as_deref()) else {
        debug!(
            tx_hash = %transfer.tx_hash,
            address = %transfer.address,
            "transfer matches no deposit slot"
        );
        return None;
    };
    Some(Transaction::Deposit(DepositPayload {
        chain,
        block: transfer.block,
        tx_hash: transfer.tx_hash,
        agent: slot.agent.clone(),
        account: slot.account,
        user: slot.user,
        address: transfer.address,
        memo: transfer.memo,
        token: transfer.token,
    }))
}
