// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeSet;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::entities::{ChainId, DepositToken, TokenInfo, decimal_amount};

/// One log entry. On the wire: `{"type": "<Tag>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Transaction {
    AgentRegister(AgentRegister),
    CreateDepositAddress(CreateDepositAddress),
    Deposit(DepositPayload),
    AddWithdraw(AddWithdraw),
    ApproveWithdraw(ApproveWithdraw),
    TransferWithdraw(TransferWithdraw),
    ConfirmDeposit(ConfirmDeposit),
    TransferDeposits(TransferDeposits),
}

impl Transaction {
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::AgentRegister(_) => "AgentRegister",
            Self::CreateDepositAddress(_) => "CreateDepositAddress",
            Self::Deposit(_) => "Deposit",
            Self::AddWithdraw(_) => "AddWithdraw",
            Self::ApproveWithdraw(_) => "ApproveWithdraw",
            Self::TransferWithdraw(_) => "TransferWithdraw",
            Self::ConfirmDeposit(_) => "ConfirmDeposit",
            Self::TransferDeposits(_) => "TransferDeposits",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegister {
    pub signers: BTreeSet<Address>,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDepositAddress {
    pub agent: String,
    #[serde(default)]
    pub account: u64,
    pub chain: ChainId,
    pub user: u64,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositPayload {
    pub chain: ChainId,
    pub block: u64,
    pub tx_hash: String,
    pub agent: String,
    pub account: u64,
    pub user: u64,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub token: DepositToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddWithdraw {
    pub id: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<u64>,
    pub signatures: Vec<String>,
    pub token: TokenInfo,
    pub target_chain: ChainId,
    #[serde(with = "decimal_amount")]
    pub amount: u128,
    pub to_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveWithdraw {
    pub id: String,
    pub avs_verifying_key: String,
    pub avs_signature: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_signers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferWithdraw {
    pub withdraws: Vec<String>,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmDeposit {
    pub tx_hash: String,
    pub finalized_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDeposits {
    pub deposits: Vec<String>,
    pub tx_hash: String,
}

/// A log envelope after decoding. Envelopes with an unknown tag or a payload that does not
/// match its tag are kept so replay can skip them without losing their position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedTransaction {
    Known(Transaction),
    Unrecognized { tag: Option<String>, reason: String },
}

#[derive(Debug, Error)]
pub enum BatchDecodeError {
    #[error("batch payload is not a JSON array")]
    NotAnArray {
        #[source]
        source: serde_json::Error,
    },
}

pub fn encode_batch(txs: &[Transaction]) -> Result<String, serde_json::Error> {
    serde_json::to_string(txs)
}

pub fn decode_batch(payload: &str) -> Result<Vec<DecodedTransaction>, BatchDecodeError> {
    let envelopes: Vec<Value> = serde_json::from_str(payload)
        .map_err(|source| BatchDecodeError::NotAnArray { source })?;
    Ok(envelopes.into_iter().map(decode_envelope).collect())
}

fn decode_envelope(envelope: Value) -> DecodedTransaction {
    let tag = envelope
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned);
    match serde_json::from_value::<Transaction>(envelope) {
        Ok(tx) => DecodedTransaction::Known(tx),
        Err(err) => DecodedTransaction::Unrecognized {
            tag,
            reason: err.to_string(),
        },
    }
}
