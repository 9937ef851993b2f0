// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, hex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChainId {
    #[serde(rename = "SOL")]
    Solana,
    #[serde(rename = "TON")]
    Ton,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unsupported chain: {0}")]
pub struct UnknownChain(pub String);

impl ChainId {
    pub const ALL: [ChainId; 2] = [ChainId::Solana, ChainId::Ton];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Solana => "SOL",
            Self::Ton => "TON",
        }
    }

    /// Chains whose deposit addresses are shared and disambiguated by a memo.
    pub const fn uses_memo(&self) -> bool {
        matches!(self, Self::Ton)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = UnknownChain;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SOL" => Ok(Self::Solana),
            "TON" => Ok(Self::Ton),
            other => Err(UnknownChain(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub signers: BTreeSet<Address>,
    pub threshold: u32,
}

impl Agent {
    pub fn has_signer(&self, signer: &Address) -> bool {
        self.signers.contains(signer)
    }
}

/// Agent ids are never chosen by the submitter: they bind the signer set to the log
/// position that registered it.
pub fn derive_agent_id(signers: &BTreeSet<Address>, batch_index: u64, position: u32) -> String {
    let mut hasher = Sha256::new();
    for signer in signers {
        hasher.update(signer.as_slice());
    }
    hasher.update(format!("{batch_index}-{position}").as_bytes());
    hex::encode_prefixed(hasher.finalize())
}

/// Unique key of a deposit address: one address per user slot per agent account per chain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSlot {
    pub agent: String,
    pub account: u64,
    pub chain: ChainId,
    pub user: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositAddress {
    pub agent: String,
    pub account: u64,
    pub chain: ChainId,
    pub user: u64,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub active: bool,
}

impl DepositAddress {
    pub fn slot(&self) -> AddressSlot {
        AddressSlot {
            agent: self.agent.clone(),
            account: self.account,
            chain: self.chain,
            user: self.user,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositToken {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(with = "decimal_amount")]
    pub amount: u128,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
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
    pub confirmed: bool,
    pub transferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_tx: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    pub decimals: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WithdrawStatus {
    Initialized,
    /// Part of the stored and queried status vocabulary, so `in-progress` documents and
    /// status filters still parse. No handler assigns it and `can_advance_to` never
    /// enters or leaves it.
    InProgress,
    Approved,
    Transferred,
}

impl WithdrawStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::InProgress => "in-progress",
            Self::Approved => "approved",
            Self::Transferred => "transferred",
        }
    }

    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initialized, Self::Approved) | (Self::Approved, Self::Transferred)
        )
    }
}

impl fmt::Display for WithdrawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "initialized" => Ok(Self::Initialized),
            "in-progress" => Ok(Self::InProgress),
            "approved" => Ok(Self::Approved),
            "transferred" => Ok(Self::Transferred),
            other => Err(format!("unknown withdraw status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvsSignature {
    pub verifying_key: String,
    pub signature: String,
    #[serde(default)]
    pub non_signers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdraw {
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
    pub status: WithdrawStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avs_signature: Option<AvsSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_tx: Option<String>,
}

/// Amounts travel as decimal strings; plain JSON integers are accepted on input.
pub(crate) mod decimal_amount {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text
                .trim()
                .parse::<u128>()
                .map_err(|err| de::Error::custom(format!("invalid amount {text:?}: {err}"))),
            Raw::Number(value) => Ok(u128::from(value)),
        }
    }
}
