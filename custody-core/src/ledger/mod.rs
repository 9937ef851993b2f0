// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod memory;

use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::entities::{
    Agent, AvsSignature, ChainId, Deposit, DepositAddress, Withdraw, WithdrawStatus,
    derive_agent_id,
};
use crate::transaction::{
    AddWithdraw, AgentRegister, ApproveWithdraw, ConfirmDeposit, CreateDepositAddress,
    DecodedTransaction, DepositPayload, Transaction, TransferDeposits, TransferWithdraw,
};

pub use memory::MemoryLedger;

/// Largest account, user or block number the ledger records. Both stores reject anything
/// above it the same way, so an SQLite ledger never diverges from an in-memory one.
pub const MAX_LEDGER_INTEGER: u64 = i64::MAX as u64;

/// Where a transaction sits in the log. Part of the input of every handler that derives
/// identifiers, so replaying the same log always derives the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxPosition {
    pub batch_index: u64,
    pub position: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    UnrecognizedTransaction { tag: Option<String>, reason: String },
    InvalidAgent { reason: String },
    DuplicateAgent { id: String },
    DuplicateDepositAddress { agent: String, account: u64, chain: ChainId, user: u64 },
    DuplicateDeposit { tx_hash: String },
    UnknownDeposit { tx_hash: String },
    DepositAlreadyConfirmed { tx_hash: String },
    DepositNotFinal { tx_hash: String, block: u64, finalized_height: u64 },
    DepositAlreadyTransferred { tx_hash: String },
    DuplicateWithdraw { id: String },
    UnknownWithdraw { id: String },
    InvalidTransition { id: String, from: WithdrawStatus, to: WithdrawStatus },
    IntegerOutOfRange { field: &'static str, value: u64 },
    PositionOutOfRange { offset: usize },
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnrecognizedTransaction { tag, reason } => match tag {
                Some(tag) => write!(f, "unrecognized transaction {tag}: {reason}"),
                None => write!(f, "unrecognized transaction: {reason}"),
            },
            Self::InvalidAgent { reason } => write!(f, "invalid agent: {reason}"),
            Self::DuplicateAgent { id } => write!(f, "agent {id} already registered"),
            Self::DuplicateDepositAddress {
                agent,
                account,
                chain,
                user,
            } => write!(
                f,
                "deposit address for agent {agent} account {account} chain {chain} user {user} already exists"
            ),
            Self::DuplicateDeposit { tx_hash } => write!(f, "deposit {tx_hash} already recorded"),
            Self::UnknownDeposit { tx_hash } => write!(f, "deposit {tx_hash} not found"),
            Self::DepositAlreadyConfirmed { tx_hash } => {
                write!(f, "deposit {tx_hash} already confirmed")
            }
            Self::DepositNotFinal {
                tx_hash,
                block,
                finalized_height,
            } => write!(
                f,
                "deposit {tx_hash} at block {block} is above finalized height {finalized_height}"
            ),
            Self::DepositAlreadyTransferred { tx_hash } => {
                write!(f, "deposit {tx_hash} already transferred")
            }
            Self::DuplicateWithdraw { id } => write!(f, "withdraw {id} already exists"),
            Self::UnknownWithdraw { id } => write!(f, "withdraw {id} not found"),
            Self::InvalidTransition { id, from, to } => {
                write!(f, "withdraw {id} cannot move from {from} to {to}")
            }
            Self::IntegerOutOfRange { field, value } => {
                write!(f, "{field} {value} exceeds {MAX_LEDGER_INTEGER}")
            }
            Self::PositionOutOfRange { offset } => {
                write!(f, "batch position {offset} does not fit in 32 bits")
            }
        }
    }
}

/// Result of applying one transaction. Transactions touching several entities
/// (`TransferWithdraw`, `TransferDeposits`) may apply to some and skip others.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub ignored: Vec<IgnoreReason>,
}

impl ApplyOutcome {
    fn applied() -> Self {
        Self {
            applied: 1,
            ignored: Vec::new(),
        }
    }

    fn ignored(reason: IgnoreReason) -> Self {
        Self {
            applied: 0,
            ignored: vec![reason],
        }
    }

    fn record(&mut self, result: Result<(), IgnoreReason>) {
        match result {
            Ok(()) => self.applied = self.applied.saturating_add(1),
            Err(reason) => self.ignored.push(reason),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.applied == 0
    }
}

/// Storage seam of the ledger. Unique keys are enforced by the store and reported as
/// [`InsertOutcome::Duplicate`]; all state-machine rules live in [`apply_transaction`].
pub trait LedgerStore {
    type Error: std::error::Error + Send + Sync + 'static;

    fn insert_agent(&mut self, agent: &Agent) -> Result<InsertOutcome, Self::Error>;

    fn insert_deposit_address(
        &mut self,
        address: &DepositAddress,
    ) -> Result<InsertOutcome, Self::Error>;

    fn insert_deposit(&mut self, deposit: &Deposit) -> Result<InsertOutcome, Self::Error>;

    fn find_deposit(&self, tx_hash: &str) -> Result<Option<Deposit>, Self::Error>;

    fn update_deposit(&mut self, deposit: &Deposit) -> Result<(), Self::Error>;

    fn insert_withdraw(&mut self, withdraw: &Withdraw) -> Result<InsertOutcome, Self::Error>;

    fn find_withdraw(&self, id: &str) -> Result<Option<Withdraw>, Self::Error>;

    fn update_withdraw(&mut self, withdraw: &Withdraw) -> Result<(), Self::Error>;
}

/// Applies every envelope of one batch in order. Skipped transactions are logged, never
/// surfaced; only store failures abort.
pub fn replay_batch<S: LedgerStore>(
    store: &mut S,
    batch_index: u64,
    txs: &[DecodedTransaction],
) -> Result<Vec<ApplyOutcome>, S::Error> {
    let mut outcomes = Vec::with_capacity(txs.len());
    for (offset, decoded) in txs.iter().enumerate() {
        let outcome = match (tx_position(batch_index, offset), decoded) {
            (Err(reason), _) => ApplyOutcome::ignored(reason),
            (Ok(position), DecodedTransaction::Known(tx)) => {
                apply_transaction(store, tx, position)?
            }
            (Ok(_), DecodedTransaction::Unrecognized { tag, reason }) => {
                ApplyOutcome::ignored(IgnoreReason::UnrecognizedTransaction {
                    tag: tag.clone(),
                    reason: reason.clone(),
                })
            }
        };
        for reason in &outcome.ignored {
            warn!(batch_index, offset, reason = %reason, "ignored transaction");
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Positions feed agent id derivation, so an offset past `u32::MAX` is refused instead of
/// being folded onto an existing position.
fn tx_position(batch_index: u64, offset: usize) -> Result<TxPosition, IgnoreReason> {
    let position =
        u32::try_from(offset).map_err(|_| IgnoreReason::PositionOutOfRange { offset })?;
    Ok(TxPosition {
        batch_index,
        position,
    })
}

fn check_integers(fields: &[(&'static str, Option<u64>)]) -> Result<(), IgnoreReason> {
    let out_of_range = fields.iter().find_map(|&(field, value)| {
        value
            .filter(|value| *value > MAX_LEDGER_INTEGER)
            .map(|value| IgnoreReason::IntegerOutOfRange { field, value })
    });
    match out_of_range {
        Some(reason) => Err(reason),
        None => Ok(()),
    }
}

pub fn apply_transaction<S: LedgerStore>(
    store: &mut S,
    tx: &Transaction,
    position: TxPosition,
) -> Result<ApplyOutcome, S::Error> {
    match tx {
        Transaction::AgentRegister(data) => apply_agent_register(store, data, position),
        Transaction::CreateDepositAddress(data) => apply_create_deposit_address(store, data),
        Transaction::Deposit(data) => apply_deposit(store, data),
        Transaction::AddWithdraw(data) => apply_add_withdraw(store, data),
        Transaction::ApproveWithdraw(data) => apply_approve_withdraw(store, data),
        Transaction::TransferWithdraw(data) => apply_transfer_withdraw(store, data),
        Transaction::ConfirmDeposit(data) => apply_confirm_deposit(store, data),
        Transaction::TransferDeposits(data) => apply_transfer_deposits(store, data),
    }
}

fn insert_result(outcome: InsertOutcome, duplicate: impl FnOnce() -> IgnoreReason) -> ApplyOutcome {
    match outcome {
        InsertOutcome::Inserted => ApplyOutcome::applied(),
        InsertOutcome::Duplicate => ApplyOutcome::ignored(duplicate()),
    }
}

fn apply_agent_register<S: LedgerStore>(
    store: &mut S,
    data: &AgentRegister,
    position: TxPosition,
) -> Result<ApplyOutcome, S::Error> {
    let signer_count = data.signers.len();
    if signer_count == 0 {
        return Ok(ApplyOutcome::ignored(IgnoreReason::InvalidAgent {
            reason: "signer set is empty".to_string(),
        }));
    }
    if data.threshold == 0 || data.threshold as usize > signer_count {
        return Ok(ApplyOutcome::ignored(IgnoreReason::InvalidAgent {
            reason: format!(
                "threshold {} out of range for {signer_count} signers",
                data.threshold
            ),
        }));
    }

    let agent = Agent {
        id: derive_agent_id(&data.signers, position.batch_index, position.position),
        signers: data.signers.clone(),
        threshold: data.threshold,
    };
    let outcome = store.insert_agent(&agent)?;
    Ok(insert_result(outcome, || IgnoreReason::DuplicateAgent {
        id: agent.id.clone(),
    }))
}

fn apply_create_deposit_address<S: LedgerStore>(
    store: &mut S,
    data: &CreateDepositAddress,
) -> Result<ApplyOutcome, S::Error> {
    if let Err(reason) =
        check_integers(&[("account", Some(data.account)), ("user", Some(data.user))])
    {
        return Ok(ApplyOutcome::ignored(reason));
    }
    let address = DepositAddress {
        agent: data.agent.clone(),
        account: data.account,
        chain: data.chain,
        user: data.user,
        address: data.address.clone(),
        memo: data.memo.clone(),
        active: true,
    };
    let outcome = store.insert_deposit_address(&address)?;
    Ok(insert_result(outcome, || {
        IgnoreReason::DuplicateDepositAddress {
            agent: data.agent.clone(),
            account: data.account,
            chain: data.chain,
            user: data.user,
        }
    }))
}

fn apply_deposit<S: LedgerStore>(
    store: &mut S,
    data: &DepositPayload,
) -> Result<ApplyOutcome, S::Error> {
    if let Err(reason) = check_integers(&[
        ("block", Some(data.block)),
        ("account", Some(data.account)),
        ("user", Some(data.user)),
    ]) {
        return Ok(ApplyOutcome::ignored(reason));
    }
    let deposit = Deposit {
        chain: data.chain,
        block: data.block,
        tx_hash: data.tx_hash.clone(),
        agent: data.agent.clone(),
        account: data.account,
        user: data.user,
        address: data.address.clone(),
        memo: data.memo.clone(),
        token: data.token.clone(),
        confirmed: false,
        transferred: false,
        transfer_tx: None,
    };
    let outcome = store.insert_deposit(&deposit)?;
    Ok(insert_result(outcome, || IgnoreReason::DuplicateDeposit {
        tx_hash: data.tx_hash.clone(),
    }))
}

fn apply_add_withdraw<S: LedgerStore>(
    store: &mut S,
    data: &AddWithdraw,
) -> Result<ApplyOutcome, S::Error> {
    if let Err(reason) = check_integers(&[("account", data.account), ("user", data.user)]) {
        return Ok(ApplyOutcome::ignored(reason));
    }
    let withdraw = Withdraw {
        id: data.id.clone(),
        agent: data.agent.clone(),
        account: data.account,
        user: data.user,
        signatures: data.signatures.clone(),
        token: data.token.clone(),
        target_chain: data.target_chain,
        amount: data.amount,
        to_address: data.to_address.clone(),
        status: WithdrawStatus::Initialized,
        avs_signature: None,
        transfer_tx: None,
    };
    let outcome = store.insert_withdraw(&withdraw)?;
    Ok(insert_result(outcome, || IgnoreReason::DuplicateWithdraw {
        id: data.id.clone(),
    }))
}

fn apply_approve_withdraw<S: LedgerStore>(
    store: &mut S,
    data: &ApproveWithdraw,
) -> Result<ApplyOutcome, S::Error> {
    let result = advance_withdraw(store, &data.id, WithdrawStatus::Approved, |withdraw| {
        withdraw.avs_signature = Some(AvsSignature {
            verifying_key: data.avs_verifying_key.clone(),
            signature: data.avs_signature.clone(),
            non_signers: data.non_signers.clone(),
        });
    })?;
    let mut outcome = ApplyOutcome::default();
    outcome.record(result);
    Ok(outcome)
}

fn apply_transfer_withdraw<S: LedgerStore>(
    store: &mut S,
    data: &TransferWithdraw,
) -> Result<ApplyOutcome, S::Error> {
    let mut outcome = ApplyOutcome::default();
    for id in &data.withdraws {
        let result = advance_withdraw(store, id, WithdrawStatus::Transferred, |withdraw| {
            withdraw.transfer_tx = Some(data.tx_hash.clone());
        })?;
        outcome.record(result);
    }
    Ok(outcome)
}

fn advance_withdraw<S: LedgerStore>(
    store: &mut S,
    id: &str,
    next: WithdrawStatus,
    update: impl FnOnce(&mut Withdraw),
) -> Result<Result<(), IgnoreReason>, S::Error> {
    let Some(mut withdraw) = store.find_withdraw(id)? else {
        return Ok(Err(IgnoreReason::UnknownWithdraw { id: id.to_string() }));
    };
    if !withdraw.status.can_advance_to(next) {
        return Ok(Err(IgnoreReason::InvalidTransition {
            id: id.to_string(),
            from: withdraw.status,
            to: next,
        }));
    }
    update(&mut withdraw);
    withdraw.status = next;
    store.update_withdraw(&withdraw)?;
    Ok(Ok(()))
}

fn apply_confirm_deposit<S: LedgerStore>(
    store: &mut S,
    data: &ConfirmDeposit,
) -> Result<ApplyOutcome, S::Error> {
    let Some(mut deposit) = store.find_deposit(&data.tx_hash)? else {
        return Ok(ApplyOutcome::ignored(IgnoreReason::UnknownDeposit {
            tx_hash: data.tx_hash.clone(),
        }));
    };
    if deposit.confirmed {
        return Ok(ApplyOutcome::ignored(
            IgnoreReason::DepositAlreadyConfirmed {
                tx_hash: data.tx_hash.clone(),
            },
        ));
    }
    if deposit.block > data.finalized_height {
        return Ok(ApplyOutcome::ignored(IgnoreReason::DepositNotFinal {
            tx_hash: data.tx_hash.clone(),
            block: deposit.block,
            finalized_height: data.finalized_height,
        }));
    }
    deposit.confirmed = true;
    store.update_deposit(&deposit)?;
    Ok(ApplyOutcome::applied())
}

fn apply_transfer_deposits<S: LedgerStore>(
    store: &mut S,
    data: &TransferDeposits,
) -> Result<ApplyOutcome, S::Error> {
    let mut outcome = ApplyOutcome::default();
    for tx_hash in &data.deposits {
        let Some(mut deposit) = store.find_deposit(tx_hash)? else {
            outcome.record(Err(IgnoreReason::UnknownDeposit {
                tx_hash: tx_hash.clone(),
            }));
            continue;
        };
        if deposit.transferred {
            outcome.record(Err(IgnoreReason::DepositAlreadyTransferred {
                tx_hash: tx_hash.clone(),
            }));
            continue;
        }
        deposit.transferred = true;
        deposit.transfer_tx = Some(data.tx_hash.clone());
        store.update_deposit(&deposit)?;
        outcome.record(Ok(()));
    }
    Ok(outcome)
}

/// Canonical, ordered view of a whole ledger. Two ledgers folded from the same log produce
/// byte-identical encodings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub next_index: u64,
    pub agents: Vec<Agent>,
    pub deposit_addresses: Vec<DepositAddress>,
    pub deposits: Vec<Deposit>,
    pub withdraws: Vec<Withdraw>,
}

impl LedgerSnapshot {
    pub fn to_canonical_json(&self) -> Vec<u8> {
        // Every field is a plain serde type with derived impls; encoding cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}
