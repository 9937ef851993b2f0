// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeSet;

use alloy_primitives::{Address, hex};
use custody_core::transaction::{AddWithdraw, AgentRegister, CreateDepositAddress};
use custody_core::{ChainId, MAX_LEDGER_INTEGER, Transaction, WithdrawStatus};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::info;

use super::{ApiError, AppState, ValidationError};
use crate::storage::OwnerFilter;

#[derive(Debug, Deserialize)]
struct RegisterAgentParams {
    signers: Vec<String>,
    threshold: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserAgentsParams {
    user_address: String,
}

#[derive(Debug, Deserialize)]
struct AgentParams {
    agent: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressRangeParams {
    chain: String,
    agent: String,
    #[serde(default)]
    account: u64,
    address_range: (u64, u64),
}

#[derive(Debug, Deserialize)]
struct DepositAddressesParams {
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    chain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwnerParams {
    agent: String,
    #[serde(default)]
    account: Option<u64>,
    #[serde(default)]
    user: Option<u64>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddWithdrawParams {
    agent: String,
    #[serde(default)]
    account: Option<u64>,
    #[serde(default)]
    user: Option<u64>,
    signatures: Vec<String>,
    token: String,
    target_chain: String,
    amount: AmountParam,
    to_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AmountParam {
    Text(String),
    Number(u64),
}

#[derive(Debug, Default, Deserialize)]
struct TokensParams {
    #[serde(default)]
    chain: Option<String>,
}

/// Absent or `null` params read as an empty object.
fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ValidationError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|err| ValidationError::InvalidParams(err.to_string()))
}

fn parse_chain(value: &str) -> Result<ChainId, ValidationError> {
    value
        .parse()
        .map_err(|_| ValidationError::UnsupportedChain(value.to_string()))
}

fn check_integer(field: &'static str, value: Option<u64>) -> Result<(), ValidationError> {
    match value {
        Some(value) if value > MAX_LEDGER_INTEGER => {
            Err(ValidationError::IntegerOutOfRange { field, value })
        }
        _ => Ok(()),
    }
}

impl OwnerParams {
    fn check(&self) -> Result<(), ValidationError> {
        check_integer("account", self.account)?;
        check_integer("user", self.user)
    }
}

fn parse_amount(amount: AmountParam) -> Result<u128, ValidationError> {
    let amount = match amount {
        AmountParam::Text(text) => text
            .parse::<u128>()
            .map_err(|_| ValidationError::InvalidAmount)?,
        AmountParam::Number(value) => u128::from(value),
    };
    if amount == 0 {
        return Err(ValidationError::InvalidAmount);
    }
    Ok(amount)
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|err| ApiError::internal_error(err.to_string()))
}

async fn ensure_agent(state: &AppState, agent: &str) -> Result<(), ApiError> {
    let id = agent.to_string();
    let found = state.ledger.run(move |reader| reader.agent(&id)).await?;
    match found {
        Some(_) => Ok(()),
        None => Err(ValidationError::UnknownAgent(agent.to_string()).into()),
    }
}

async fn append(state: &AppState, txs: &[Transaction]) -> Result<Value, ApiError> {
    let index = state
        .log
        .append_and_confirm(txs, state.confirm_timeout)
        .await?;
    Ok(json!(index))
}

pub(super) async fn register_agent(state: &AppState, params: Value) -> Result<Value, ApiError> {
    let params: RegisterAgentParams = parse_params(params)?;
    let signers = params
        .signers
        .iter()
        .map(|signer| {
            signer
                .parse::<Address>()
                .map_err(|_| ValidationError::InvalidSigner(signer.clone()))
        })
        .collect::<Result<BTreeSet<_>, _>>()?;
    if params.threshold == 0 || params.threshold as usize > signers.len() {
        return Err(ValidationError::InvalidThreshold {
            threshold: params.threshold,
            signers: signers.len(),
        }
        .into());
    }

    let tx = Transaction::AgentRegister(AgentRegister {
        signers,
        threshold: params.threshold,
    });
    let index = append(state, &[tx]).await?;
    info!(%index, "agent registration appended");
    Ok(index)
}

pub(super) async fn get_user_agents(state: &AppState, params: Value) -> Result<Value, ApiError> {
    let params: UserAgentsParams = parse_params(params)?;
    let signer = params
        .user_address
        .parse::<Address>()
        .map_err(|_| ValidationError::InvalidSigner(params.user_address.clone()))?;
    let agents = state
        .ledger
        .run(move |reader| reader.agents_for_signer(&signer))
        .await?;
    to_result(&agents)
}

pub(super) async fn get_agent_data(state: &AppState, params: Value) -> Result<Value, ApiError> {
    let AgentParams { agent } = parse_params(params)?;
    let (addresses, deposits, withdraws) = state
        .ledger
        .run(move |reader| {
            let owner = OwnerFilter::agent(&agent);
            Ok((
                reader.deposit_addresses(Some(&agent), None)?,
                reader.deposits(owner)?,
                reader.withdraws(owner, None)?,
            ))
        })
        .await?;
    Ok(json!({
        "depositAddresses": to_result(&addresses)?,
        "deposits": to_result(&deposits)?,
        "withdraws": to_result(&withdraws)?,
    }))
}

pub(super) async fn create_deposit_address_range(
    state: &AppState,
    params: Value,
) -> Result<Value, ApiError> {
    let params: AddressRangeParams = parse_params(params)?;
    let chain = parse_chain(&params.chain)?;
    let (from, to) = params.address_range;
    if from >= to {
        return Err(ValidationError::InvalidRange { from, to }.into());
    }
    check_integer("account", Some(params.account))?;
    check_integer("user", Some(to - 1))?;
    let len = to - from;
    if len > state.max_address_range {
        return Err(ValidationError::RangeTooLarge {
            len,
            max: state.max_address_range,
        }
        .into());
    }
    ensure_agent(state, &params.agent).await?;

    let txs = (from..to)
        .map(|user| -> Result<Transaction, ValidationError> {
            let derived = state
                .deriver
                .derive(chain, &params.agent, params.account, user)
                .map_err(ValidationError::from)?;
            Ok(Transaction::CreateDepositAddress(CreateDepositAddress {
                agent: params.agent.clone(),
                account: params.account,
                chain,
                user,
                address: derived.address,
                memo: derived.memo,
            }))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let index = append(state, &txs).await?;
    info!(%chain, agent = %params.agent, from, to, %index, "deposit addresses appended");
    Ok(index)
}

pub(super) async fn get_deposit_addresses(
    state: &AppState,
    params: Value,
) -> Result<Value, ApiError> {
    let params: DepositAddressesParams = parse_params(params)?;
    let chain = params.chain.as_deref().map(parse_chain).transpose()?;
    let agent = params.agent;
    let addresses = state
        .ledger
        .run(move |reader| reader.deposit_addresses(agent.as_deref(), chain))
        .await?;
    to_result(&addresses)
}

pub(super) async fn get_deposits(state: &AppState, params: Value) -> Result<Value, ApiError> {
    let params: OwnerParams = parse_params(params)?;
    params.check()?;
    let deposits = state
        .ledger
        .run(move |reader| {
            reader.deposits(OwnerFilter {
                agent: &params.agent,
                account: params.account,
                user: params.user,
            })
        })
        .await?;
    to_result(&deposits)
}

pub(super) async fn get_withdraws(state: &AppState, params: Value) -> Result<Value, ApiError> {
    let params: OwnerParams = parse_params(params)?;
    params.check()?;
    let status = params
        .status
        .as_deref()
        .map(str::parse::<WithdrawStatus>)
        .transpose()
        .map_err(ValidationError::InvalidParams)?;
    let withdraws = state
        .ledger
        .run(move |reader| {
            let owner = OwnerFilter {
                agent: &params.agent,
                account: params.account,
                user: params.user,
            };
            reader.withdraws(owner, status)
        })
        .await?;
    to_result(&withdraws)
}

pub(super) async fn add_withdraw(state: &AppState, params: Value) -> Result<Value, ApiError> {
    let params: AddWithdrawParams = parse_params(params)?;
    check_integer("account", params.account)?;
    check_integer("user", params.user)?;
    let target_chain = parse_chain(&params.target_chain)?;
    let token = state
        .tokens
        .by_symbol(target_chain, &params.token)
        .cloned()
        .ok_or(ValidationError::TokenNotFound)?;
    let amount = parse_amount(params.amount)?;
    if params.signatures.is_empty() {
        return Err(ValidationError::MissingSignatures.into());
    }
    ensure_agent(state, &params.agent).await?;

    let id = hex::encode_prefixed(rand::random::<[u8; 32]>());
    let tx = Transaction::AddWithdraw(AddWithdraw {
        id: id.clone(),
        agent: params.agent,
        account: params.account,
        user: params.user,
        signatures: params.signatures,
        token,
        target_chain,
        amount,
        to_address: params.to_address,
    });
    let index = append(state, &[tx]).await?;
    info!(%id, %target_chain, %index, "withdraw appended");
    Ok(index)
}

pub(super) fn get_available_tokens(state: &AppState, params: Value) -> Result<Value, ApiError> {
    let params: TokensParams = parse_params(params)?;
    match params.chain.as_deref().map(parse_chain).transpose()? {
        Some(chain) => to_result(&state.tokens.for_chain(chain)),
        None => to_result(state.tokens.all()),
    }
}
