// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::chain::DerivationError;
use crate::sequencer_log::LogError;
use crate::storage::StorageAccessError;

/// Request rejected before anything reaches the log.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("chain not supported: {0}")]
    UnsupportedChain(String),
    #[error("invalid signer address {0}")]
    InvalidSigner(String),
    #[error("threshold {threshold} out of range for {signers} signers")]
    InvalidThreshold { threshold: u32, signers: usize },
    #[error("agent {0} not found")]
    UnknownAgent(String),
    #[error("invalid address range [{from}, {to})")]
    InvalidRange { from: u64, to: u64 },
    #[error("{field} {value} exceeds {max}", max = custody_core::MAX_LEDGER_INTEGER)]
    IntegerOutOfRange { field: &'static str, value: u64 },
    #[error("address range of {len} exceeds the limit of {max}")]
    RangeTooLarge { len: u64, max: u64 },
    #[error("Withdrawing token info not found")]
    TokenNotFound,
    #[error("amount must be a positive integer")]
    InvalidAmount,
    #[error("at least one signature is required")]
    MissingSignatures,
    #[error(transparent)]
    Derivation(#[from] DerivationError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Method '{0}' not found")]
    MethodNotFound(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("log writer queue full")]
    Overloaded,
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    jsonrpc: &'static str,
    id: Value,
    error: String,
    status: &'static str,
}

impl ApiError {
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::MethodNotFound(_) | Self::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::MethodNotFound(_) => "MethodNotFound",
            Self::Validation(_) => "ValidationError",
            Self::Overloaded => "Overloaded",
            Self::Unavailable(_) => "Unavailable",
            Self::Internal(_) => "InternalError",
        }
    }

    /// `{"jsonrpc": "2.0", "id": .., "error": "<Kind>: <message>", "status": "ERROR"}`
    pub fn into_rpc_response(self, id: Value) -> Response {
        let body = ErrorResponse {
            jsonrpc: "2.0",
            id,
            error: format!("{}: {self}", self.kind()),
            status: "ERROR",
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<LogError> for ApiError {
    fn from(value: LogError) -> Self {
        match value {
            LogError::Overloaded => Self::Overloaded,
            LogError::WriterUnavailable | LogError::Timeout { .. } => {
                Self::Unavailable(value.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StorageAccessError> for ApiError {
    fn from(value: StorageAccessError) -> Self {
        Self::Internal(format!("ledger read failed: {value}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_rpc_response(Value::Null)
    }
}
