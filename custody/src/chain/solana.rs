// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use custody_core::{ChainId, Deposit, TokenInfo};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::transfers::{block_transfers, deposit_matches_transaction};
use super::{AddressBook, ChainClient, ChainError, ObservedTransfer};

/// Slot skipped by the leader, or missing from long-term storage.
const SKIPPED_SLOT_CODES: [i64; 3] = [-32007, -32009, -32004];

#[derive(Debug, Clone)]
pub struct SolanaRpcConfig {
    pub url: String,
    pub request_timeout: Duration,
}

/// Solana JSON-RPC client reading at `finalized` commitment only.
pub struct SolanaRpcClient {
    client: Client,
    url: String,
    tokens: Vec<TokenInfo>,
    request_id: AtomicU64,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// `getBlock` result with full transaction details in `jsonParsed` encoding.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcBlock {
    #[serde(default)]
    pub transactions: Vec<RpcBlockTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlockTransaction {
    pub transaction: Option<RpcTransaction>,
    pub meta: Option<RpcTransactionMeta>,
}

/// `getTransaction` result in `jsonParsed` encoding.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfirmedTransaction {
    pub slot: u64,
    pub transaction: RpcTransaction,
    pub meta: Option<RpcTransactionMeta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransaction {
    pub signatures: Vec<String>,
    pub message: RpcMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcMessage {
    #[serde(default)]
    pub instructions: Vec<RpcInstruction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcInstruction {
    #[serde(default)]
    pub program_id: Option<String>,
    #[serde(default)]
    pub parsed: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcInnerInstructions {
    #[serde(default)]
    pub instructions: Vec<RpcInstruction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransactionMeta {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub pre_token_balances: Option<Vec<RpcTokenBalance>>,
    #[serde(default)]
    pub post_token_balances: Option<Vec<RpcTokenBalance>>,
    #[serde(default)]
    pub inner_instructions: Option<Vec<RpcInnerInstructions>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTokenBalance {
    pub account_index: usize,
    pub mint: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub ui_token_amount: RpcTokenAmount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTokenAmount {
    pub amount: String,
    pub decimals: u8,
}

impl SolanaRpcClient {
    pub fn new(config: SolanaRpcConfig, tokens: Vec<TokenInfo>) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| ChainError::Transport {
                method: "client",
                source,
            })?;
        Ok(Self {
            client,
            url: config.url,
            tokens,
            request_id: AtomicU64::new(0),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<Option<T>, ChainError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        debug!(method, id, "solana rpc call");

        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| ChainError::Transport { method, source })?
            .json()
            .await
            .map_err(|source| ChainError::Transport { method, source })?;

        if let Some(error) = response.error {
            return Err(ChainError::Rpc {
                method,
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result)
    }

    async fn get_block(&self, slot: u64) -> Result<Option<RpcBlock>, ChainError> {
        let params = json!([
            slot,
            {
                "encoding": "jsonParsed",
                "transactionDetails": "full",
                "rewards": false,
                "maxSupportedTransactionVersion": 0,
                "commitment": "finalized",
            }
        ]);
        match self.call("getBlock", params).await {
            Err(ChainError::Rpc { code, .. }) if SKIPPED_SLOT_CODES.contains(&code) => Ok(None),
            other => other,
        }
    }

    async fn get_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<RpcConfirmedTransaction>, ChainError> {
        let params = json!([
            signature,
            {
                "encoding": "jsonParsed",
                "maxSupportedTransactionVersion": 0,
                "commitment": "finalized",
            }
        ]);
        self.call("getTransaction", params).await
    }
}

#[async_trait]
impl ChainClient for SolanaRpcClient {
    fn chain(&self) -> ChainId {
        ChainId::Solana
    }

    async fn finalized_height(&self) -> Result<u64, ChainError> {
        self.call("getSlot", json!([{ "commitment": "finalized" }]))
            .await?
            .ok_or_else(|| ChainError::Malformed {
                method: "getSlot",
                reason: "missing result".to_string(),
            })
    }

    async fn block_transfers(
        &self,
        height: u64,
        watched: &AddressBook,
    ) -> Result<Vec<ObservedTransfer>, ChainError> {
        let Some(block) = self.get_block(height).await? else {
            return Ok(Vec::new());
        };
        Ok(block_transfers(height, &block, watched, &self.tokens))
    }

    async fn verify_deposit(&self, deposit: &Deposit) -> Result<bool, ChainError> {
        let Some(tx) = self.get_transaction(&deposit.tx_hash).await? else {
            return Ok(false);
        };
        Ok(deposit_matches_transaction(deposit, &tx))
    }
}
