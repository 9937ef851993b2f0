// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::storage::{StorageAccessError, StorageOpenError};

/// A batch waiting for the writer lane, answered with its assigned log index.
#[derive(Debug)]
pub struct PendingBatch {
    pub correlation_id: String,
    pub payload: String,
    pub respond_to: oneshot::Sender<Result<u64, LogError>>,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("cannot encode batch")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("log writer queue full")]
    Overloaded,
    #[error("log writer unavailable")]
    WriterUnavailable,
    #[error("append failed: {0}")]
    Append(String),
    #[error("batch {correlation_id} not visible after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },
    #[error("cannot open log storage")]
    Open {
        #[source]
        source: StorageOpenError,
    },
    #[error("cannot read log storage")]
    Read {
        #[source]
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Access(#[from] StorageAccessError),
}
