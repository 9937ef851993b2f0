// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! JSON-RPC 2.0 surface at `POST /`. Reads go to the ledger; writes are validated here and
//! appended to the sequencer log, never applied directly.

mod error;
mod methods;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Json, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::chain::AddressDeriver;
use crate::sequencer_log::SequencerLog;
use crate::storage::{BlockingStorage, LedgerReader};
use crate::tokens::TokenRegistry;

pub use error::{ApiError, ValidationError};

#[derive(Clone)]
pub struct AppState {
    pub log: SequencerLog,
    pub ledger: BlockingStorage<LedgerReader>,
    pub tokens: Arc<TokenRegistry>,
    pub deriver: AddressDeriver,
    pub confirm_timeout: Duration,
    pub max_address_range: u64,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    result: Value,
}

pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    req: Result<Json<RpcRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match req {
        Ok(req) => req,
        Err(err) => {
            return ApiError::InvalidRequest(format!("Invalid Request: {}", err.body_text()))
                .into_response();
        }
    };
    let id = req.id;
    if req.jsonrpc.as_deref() != Some("2.0") {
        return ApiError::InvalidRequest("Invalid Request: jsonrpc must be \"2.0\"".to_string())
            .into_rpc_response(id);
    }

    debug!(method = %req.method, "rpc call");
    match dispatch(&state, &req.method, req.params).await {
        Ok(result) => Json(RpcResponse {
            jsonrpc: "2.0",
            id,
            result,
        })
        .into_response(),
        Err(err) => {
            warn!(method = %req.method, error = %err, "rpc call failed");
            err.into_rpc_response(id)
        }
    }
}

async fn dispatch(state: &AppState, method: &str, params: Value) -> Result<Value, ApiError> {
    match method {
        "registerAgent" => methods::register_agent(state, params).await,
        "getUserAgents" => methods::get_user_agents(state, params).await,
        "getAgentData" => methods::get_agent_data(state, params).await,
        "createDepositAddressRange" => methods::create_deposit_address_range(state, params).await,
        "getDepositAddresses" => methods::get_deposit_addresses(state, params).await,
        "getDeposits" => methods::get_deposits(state, params).await,
        "getWithdraws" => methods::get_withdraws(state, params).await,
        "addWithdraw" => methods::add_withdraw(state, params).await,
        "getAvailableTokens" => methods::get_available_tokens(state, params),
        other => Err(ApiError::MethodNotFound(other.to_string())),
    }
}
