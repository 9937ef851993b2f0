// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::time::Duration;

use custody_core::transaction::ApproveWithdraw;
use custody_core::{ChainId, Transaction, Withdraw, WithdrawStatus};
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::key::DistKeyConfig;
use super::signing::{NoncePool, SigningService};
use super::{NodeId, OrchestratorError};
use crate::sequencer_log::{LogError, SequencerLog, new_correlation_id};
use crate::stop::StopSignal;
use crate::storage::{BlockingStorage, LedgerReader};

#[derive(Debug, Clone, Copy)]
pub struct WithdrawOrchestratorConfig {
    pub chain: ChainId,
    pub interval: Duration,
    pub confirm_timeout: Duration,
}

/// Approves initialized withdraws of one chain with a threshold signature.
///
/// Each cycle signs the whole pending set with a freshly shuffled quorum of `threshold`
/// nodes. Any signing failure drops the cycle without appending anything; the same
/// withdraws are picked up again next cycle. Signed approvals whose append fails are kept
/// with their correlation id and re-sent before anything new is signed, so a slow log
/// never costs a second signature. Only one orchestrator may run per chain.
pub struct WithdrawOrchestrator {
    signer: Arc<dyn SigningService>,
    key: DistKeyConfig,
    log: SequencerLog,
    ledger: BlockingStorage<LedgerReader>,
    config: WithdrawOrchestratorConfig,
    stop: StopSignal,
    // Index of the last approval batch; signing waits until replay has applied it.
    last_appended: Option<u64>,
    unconfirmed: Option<SignedApprovals>,
}

/// Approvals that were signed but not confirmed in the log yet.
#[derive(Debug)]
struct SignedApprovals {
    correlation_id: String,
    txs: Vec<Transaction>,
}

impl WithdrawOrchestrator {
    pub fn new(
        signer: Arc<dyn SigningService>,
        key: DistKeyConfig,
        log: SequencerLog,
        ledger: BlockingStorage<LedgerReader>,
        config: WithdrawOrchestratorConfig,
        stop: StopSignal,
    ) -> Self {
        Self {
            signer,
            key,
            log,
            ledger,
            config,
            stop,
            last_appended: None,
            unconfirmed: None,
        }
    }

    pub async fn run(mut self) {
        let chain = self.config.chain;
        info!(%chain, party = self.key.party.len(), threshold = self.key.threshold, "withdraw orchestrator started");
        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(count) => info!(%chain, count, "withdraw approvals appended"),
                Err(err) => warn!(%chain, error = %err, "withdraw approval cycle aborted"),
            }
            if !self.stop.sleep(self.config.interval).await {
                break;
            }
        }
        info!(%chain, "withdraw orchestrator stopped");
    }

    /// One approval cycle. Returns the number of withdraws approved.
    pub async fn poll_once(&mut self) -> Result<usize, OrchestratorError> {
        let chain = self.config.chain;
        if let Some(approvals) = self.unconfirmed.take() {
            info!(
                %chain,
                correlation_id = %approvals.correlation_id,
                count = approvals.txs.len(),
                "re-sending unconfirmed approvals"
            );
            return self.append_approvals(approvals).await;
        }

        let applied_up_to = self
            .ledger
            .run(|reader| reader.next_index())
            .await
            .map_err(|source| OrchestratorError::Ledger { source })?;
        if let Some(index) = self.last_appended {
            if applied_up_to <= index {
                debug!(%chain, index, "previous approvals not replayed yet");
                return Ok(0);
            }
        }

        let withdraws = self
            .ledger
            .run(move |reader| reader.withdraws_with_status(chain, WithdrawStatus::Initialized))
            .await
            .map_err(|source| OrchestratorError::Ledger { source })?;
        info!(%chain, count = withdraws.len(), "pending withdraws");
        if withdraws.is_empty() {
            return Ok(0);
        }

        let txs = self.sign_all(&withdraws).await?;
        self.append_approvals(SignedApprovals {
            correlation_id: new_correlation_id(),
            txs,
        })
        .await
    }

    async fn append_approvals(
        &mut self,
        approvals: SignedApprovals,
    ) -> Result<usize, OrchestratorError> {
        let result = self
            .log
            .append_and_confirm_with_correlation(
                approvals.correlation_id.clone(),
                &approvals.txs,
                self.config.confirm_timeout,
            )
            .await;
        match result {
            Ok(index) => {
                self.last_appended = Some(index);
                Ok(approvals.txs.len())
            }
            Err(source @ LogError::Encode { .. }) => Err(OrchestratorError::Log { source }),
            Err(source) => {
                self.unconfirmed = Some(approvals);
                Err(OrchestratorError::Log { source })
            }
        }
    }

    async fn sign_all(&self, withdraws: &[Withdraw]) -> Result<Vec<Transaction>, OrchestratorError> {
        let party = select_party(&self.key.party, self.key.threshold);
        debug!(?party, "signature party selected");

        let commitments = self
            .signer
            .request_nonces(&party, &self.key.public_key, withdraws.len())
            .await?;
        let mut pool = NoncePool::new(&party, commitments, withdraws.len())?;

        let mut txs = Vec::with_capacity(withdraws.len());
        for withdraw in withdraws {
            let round = pool.take_round().ok_or(OrchestratorError::NoncesExhausted)?;
            let message = withdraw_confirm_message(&withdraw.id);
            let signature = self
                .signer
                .request_signature(&self.key, round, &message, &party)
                .await?;
            debug!(id = %withdraw.id, "withdraw signed");
            txs.push(Transaction::ApproveWithdraw(ApproveWithdraw {
                id: withdraw.id.clone(),
                avs_verifying_key: self.key.public_key.clone(),
                avs_signature: signature,
                non_signers: Vec::new(),
            }));
        }
        Ok(txs)
    }
}

/// Uniformly random quorum of `threshold` nodes.
fn select_party(party: &[NodeId], threshold: usize) -> Vec<NodeId> {
    let mut selected = party.to_vec();
    selected.shuffle(&mut rand::thread_rng());
    selected.truncate(threshold);
    selected
}

/// Signed payload binding the withdraw id only.
pub fn withdraw_confirm_message(id: &str) -> Value {
    json!({
        "type": "WithdrawConfirm",
        "data": { "withdraw": id },
    })
}
