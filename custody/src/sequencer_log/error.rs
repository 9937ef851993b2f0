// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogWriterError {
    #[error("log writer input channel closed")]
    ChannelClosed,
    #[error("log writer shutdown requested")]
    ShutdownRequested,
    #[error("append batches failed")]
    AppendBatches {
        #[source]
        source: rusqlite::Error,
    },
}
