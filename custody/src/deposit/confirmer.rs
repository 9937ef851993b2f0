// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::time::Duration;

use custody_core::Transaction;
use custody_core::transaction::ConfirmDeposit;
use tracing::{debug, info, warn};

use super::WatcherError;
use crate::chain::ChainClient;
use crate::sequencer_log::SequencerLog;
use crate::stop::StopSignal;
use crate::storage::{BlockingStorage, LedgerReader};

#[derive(Debug, Clone, Copy)]
pub struct DepositConfirmerConfig {
    pub poll_interval: Duration,
    pub confirm_timeout: Duration,
}

/// Re-validates unconfirmed deposits once their block is final and appends a
/// `ConfirmDeposit` for each one that still checks out. Deposits that fail validation stay
/// unconfirmed and are retried every cycle.
pub struct DepositConfirmer {
    client: Arc<dyn ChainClient>,
    log: SequencerLog,
    ledger: BlockingStorage<LedgerReader>,
    config: DepositConfirmerConfig,
    stop: StopSignal,
}

impl DepositConfirmer {
    pub fn new(
        client: Arc<dyn ChainClient>,
        log: SequencerLog,
        ledger: BlockingStorage<LedgerReader>,
        config: DepositConfirmerConfig,
        stop: StopSignal,
    ) -> Self {
        Self {
            client,
            log,
            ledger,
            config,
            stop,
        }
    }

    pub async fn run(self) {
        let chain = self.client.chain();
        info!(%chain, "deposit confirmer started");
        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(count) => info!(%chain, count, "deposit confirmations appended"),
                Err(err) => warn!(%chain, error = %err, "deposit confirmer cycle failed"),
            }
            if !self.stop.sleep(self.config.poll_interval).await {
                break;
            }
        }
        info!(%chain, "deposit confirmer stopped");
    }

    /// One confirmation cycle. Returns the number of confirmations appended.
    pub async fn poll_once(&self) -> Result<usize, WatcherError> {
        let chain = self.client.chain();
        let pending = self
            .ledger
            .run(move |reader| reader.unconfirmed_deposits(chain))
            .await
            .map_err(|source| WatcherError::Ledger { source })?;
        if pending.is_empty() {
            return Ok(0);
        }

        let finalized = self.client.finalized_height().await?;
        debug!(%chain, finalized, pending = pending.len(), "confirming deposits");

        let mut txs = Vec::new();
        for deposit in pending.iter().filter(|deposit| deposit.block <= finalized) {
            match self.client.verify_deposit(deposit).await {
                Ok(true) => txs.push(Transaction::ConfirmDeposit(ConfirmDeposit {
                    tx_hash: deposit.tx_hash.clone(),
                    finalized_height: finalized,
                })),
                Ok(false) => warn!(%chain, tx_hash = %deposit.tx_hash, "deposit not validated"),
                Err(err) => warn!(
                    %chain,
                    tx_hash = %deposit.tx_hash,
                    error = %err,
                    "deposit validation failed"
                ),
            }
        }

        if !txs.is_empty() {
            self.log
                .append_and_confirm(&txs, self.config.confirm_timeout)
                .await
                .map_err(|source| WatcherError::Log { source })?;
        }
        Ok(txs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::{DepositConfirmer, DepositConfirmerConfig};
    use crate::chain::mock::MockChain;
    use crate::stop::StopSignal;
    use crate::storage::OwnerFilter;
    use crate::testing::TestNode;
    use custody_core::transaction::DepositPayload;
    use custody_core::{ChainId, DepositToken, Transaction};
    use std::sync::Arc;
    use std::time::Duration;

    fn deposit(tx_hash: &str, block: u64) -> Transaction {
        Transaction::Deposit(DepositPayload {
            chain: ChainId::Solana,
            block,
            tx_hash: tx_hash.to_string(),
            agent: "a1".to_string(),
            account: 0,
            user: 1,
            address: "vault1".to_string(),
            memo: None,
            token: DepositToken {
                symbol: "SOL".to_string(),
                contract: None,
                amount: 100,
                decimals: 9,
            },
        })
    }

    async fn confirmed_hashes(node: &TestNode) -> Vec<String> {
        node.settle().await;
        let mut hashes: Vec<String> = node
            .ledger
            .run(|reader| reader.deposits(OwnerFilter::agent("a1")))
            .await
            .expect("deposits")
            .into_iter()
            .filter(|deposit| deposit.confirmed)
            .map(|deposit| deposit.tx_hash)
            .collect();
        hashes.sort();
        hashes
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn confirms_only_final_and_valid_deposits() {
        let node = TestNode::start().await;
        node.append(&[deposit("final", 5), deposit("recent", 9), deposit("bogus", 4)])
            .await;

        let chain = Arc::new(MockChain::default());
        chain.set_finalized(6);
        chain.mark_valid("final");
        chain.mark_valid("recent");
        let confirmer = DepositConfirmer::new(
            chain.clone(),
            node.log.clone(),
            node.ledger.clone(),
            DepositConfirmerConfig {
                poll_interval: Duration::from_millis(10),
                confirm_timeout: Duration::from_secs(2),
            },
            StopSignal::new(),
        );

        assert_eq!(confirmer.poll_once().await.expect("first cycle"), 1);
        assert_eq!(confirmed_hashes(&node).await, vec!["final".to_string()]);
        let mut verified = chain.verified();
        verified.sort();
        assert_eq!(verified, vec!["bogus".to_string(), "final".to_string()]);

        chain.set_finalized(9);
        assert_eq!(confirmer.poll_once().await.expect("second cycle"), 1);
        assert_eq!(
            confirmed_hashes(&node).await,
            vec!["final".to_string(), "recent".to_string()]
        );

        chain.mark_valid("bogus");
        assert_eq!(confirmer.poll_once().await.expect("retry cycle"), 1);
        assert_eq!(confirmed_hashes(&node).await.len(), 3);
        assert_eq!(confirmer.poll_once().await.expect("nothing left"), 0);
    }
}
