// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Solana transfer extraction and deposit re-validation. Pure functions over RPC payloads.
//!
//! Detection and confirmation share [`transaction_credits`], so any deposit the watcher
//! records is one the confirmer can validate.

use std::collections::BTreeMap;

use custody_core::{Deposit, DepositToken, TokenInfo};
use serde_json::Value;

use super::solana::{
    RpcBlock, RpcConfirmedTransaction, RpcInstruction, RpcTokenBalance, RpcTransaction,
    RpcTransactionMeta,
};
use super::{AddressBook, ObservedTransfer};

pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";
const TOKEN_PROGRAM_IDS: [&str; 2] = [
    "TokenkegQfeZyiNwAJbNbGqPFXCWuBvf9Ss623VQ5DA",
    "TokenzQdBNbLqP5VEhdkAS6EPFLC1PQnbrW7Mn5ySVW",
];
const NATIVE_SYMBOL: &str = "SOL";
const NATIVE_DECIMALS: u8 = 9;

/// Value one transaction moved into one address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Credit {
    address: String,
    mint: Option<String>,
    amount: u128,
}

/// Credits of a successful transaction.
///
/// Native: system-program `transfer`/`transferWithSeed` instructions, top-level or inner
/// (CPI), summed per destination. Tokens: positive owner/mint balance changes, counted
/// only when a token-program transfer ran in the transaction. Lamports that reach an
/// address any other way are not credits.
fn transaction_credits(tx: &RpcTransaction, meta: &RpcTransactionMeta) -> Vec<Credit> {
    if meta.err.is_some() {
        return Vec::new();
    }
    let instructions = || {
        tx.message.instructions.iter().chain(
            meta.inner_instructions
                .iter()
                .flatten()
                .flat_map(|inner| inner.instructions.iter()),
        )
    };

    let mut native: BTreeMap<&str, u128> = BTreeMap::new();
    for (destination, lamports) in instructions().filter_map(system_transfer) {
        let total = native.entry(destination).or_default();
        *total = total.saturating_add(lamports);
    }
    let mut credits: Vec<Credit> = native
        .into_iter()
        .filter(|(_, amount)| *amount > 0)
        .map(|(address, amount)| Credit {
            address: address.to_string(),
            mint: None,
            amount,
        })
        .collect();

    if instructions().any(is_token_transfer) {
        credits.extend(token_credits(meta).into_iter().map(|credit| Credit {
            address: credit.owner,
            mint: Some(credit.mint),
            amount: credit.amount,
        }));
    }
    credits
}

/// Every native or registered-token credit into a watched address.
pub fn block_transfers(
    height: u64,
    block: &RpcBlock,
    watched: &AddressBook,
    tokens: &[TokenInfo],
) -> Vec<ObservedTransfer> {
    let mut transfers = Vec::new();
    for entry in &block.transactions {
        let (Some(tx), Some(meta)) = (&entry.transaction, &entry.meta) else {
            continue;
        };
        let Some(tx_hash) = tx.signatures.first() else {
            continue;
        };

        for credit in transaction_credits(tx, meta) {
            if !watched.is_watched(&credit.address) {
                continue;
            }
            let token = match credit.mint {
                None => DepositToken {
                    symbol: NATIVE_SYMBOL.to_string(),
                    contract: None,
                    amount: credit.amount,
                    decimals: NATIVE_DECIMALS,
                },
                Some(mint) => {
                    let Some(token) = tokens
                        .iter()
                        .find(|token| token.contract.as_deref() == Some(mint.as_str()))
                    else {
                        continue;
                    };
                    DepositToken {
                        symbol: token.symbol.clone(),
                        contract: Some(mint),
                        amount: credit.amount,
                        decimals: token.decimals,
                    }
                }
            };
            transfers.push(ObservedTransfer {
                tx_hash: tx_hash.clone(),
                block: height,
                address: credit.address,
                memo: None,
                token,
            });
        }
    }
    transfers
}

/// Checks a re-fetched transaction against a recorded deposit: same signature and slot,
/// and a credit of exactly the recorded token and amount into the recorded address.
pub fn deposit_matches_transaction(deposit: &Deposit, tx: &RpcConfirmedTransaction) -> bool {
    let Some(meta) = &tx.meta else {
        return false;
    };
    if tx.slot != deposit.block || tx.transaction.signatures.first() != Some(&deposit.tx_hash) {
        return false;
    }
    transaction_credits(&tx.transaction, meta)
        .into_iter()
        .any(|credit| {
            credit.address == deposit.address
                && credit.mint == deposit.token.contract
                && credit.amount == deposit.token.amount
        })
}

fn system_transfer(ix: &RpcInstruction) -> Option<(&str, u128)> {
    if ix.program_id.as_deref() != Some(SYSTEM_PROGRAM_ID) {
        return None;
    }
    let parsed = ix.parsed.as_ref()?;
    if !matches!(
        parsed.get("type").and_then(Value::as_str),
        Some("transfer" | "transferWithSeed")
    ) {
        return None;
    }
    let info = parsed.get("info")?;
    let destination = info.get("destination").and_then(Value::as_str)?;
    let lamports = info.get("lamports").and_then(Value::as_u64)?;
    Some((destination, u128::from(lamports)))
}

fn is_token_transfer(ix: &RpcInstruction) -> bool {
    let Some(program) = ix.program_id.as_deref() else {
        return false;
    };
    TOKEN_PROGRAM_IDS.contains(&program)
        && matches!(
            ix.parsed
                .as_ref()
                .and_then(|parsed| parsed.get("type"))
                .and_then(Value::as_str),
            Some("transfer" | "transferChecked")
        )
}

struct TokenCredit {
    owner: String,
    mint: String,
    amount: u128,
}

fn token_credits(meta: &RpcTransactionMeta) -> Vec<TokenCredit> {
    type Change<'a> = (Option<&'a RpcTokenBalance>, Option<&'a RpcTokenBalance>);
    let mut changes: BTreeMap<(usize, &str), Change<'_>> = BTreeMap::new();
    for balance in meta.pre_token_balances.iter().flatten() {
        changes
            .entry((balance.account_index, balance.mint.as_str()))
            .or_default()
            .0 = Some(balance);
    }
    for balance in meta.post_token_balances.iter().flatten() {
        changes
            .entry((balance.account_index, balance.mint.as_str()))
            .or_default()
            .1 = Some(balance);
    }

    changes
        .into_iter()
        .filter_map(|((_, mint), (pre, post))| {
            let pre_amount = pre.map_or(Some(0), token_amount)?;
            let post_amount = post.map_or(Some(0), token_amount)?;
            let owner = pre
                .and_then(|b| b.owner.clone())
                .or_else(|| post.and_then(|b| b.owner.clone()))?;
            (post_amount > pre_amount).then(|| TokenCredit {
                owner,
                mint: mint.to_string(),
                amount: post_amount - pre_amount,
            })
        })
        .collect()
}

fn token_amount(balance: &RpcTokenBalance) -> Option<u128> {
    balance.ui_token_amount.amount.parse().ok()
}
