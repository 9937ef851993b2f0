// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use custody_core::ChainId;
use tracing_subscriber::EnvFilter;

use custody::api::AppState;
use custody::chain::{AddressDeriver, ChainClient, SolanaRpcClient, SolanaRpcConfig};
use custody::deposit::{
    DepositConfirmer, DepositConfirmerConfig, DepositWatcher, DepositWatcherConfig,
};
use custody::replay::ReplayEngine;
use custody::sequencer_log::{LogWriterConfig, LogWriterError, SequencerLog, SequencerLogConfig};
use custody::stop::StopSignal;
use custody::storage::{BlockingStorage, LedgerDb, LedgerReader};
use custody::tokens::TokenRegistry;
use custody::withdraw::{
    DistKeyConfig, HttpSigningService, WithdrawOrchestrator, WithdrawOrchestratorConfig,
};

const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_LOG_DB_PATH: &str = "custody-log.db";
const DEFAULT_LEDGER_DB_PATH: &str = "custody-ledger.db";
const DEFAULT_SQLITE_SYNCHRONOUS: &str = "NORMAL";
const DEFAULT_LOG_QUEUE_CAP: usize = 1024;
const DEFAULT_LOG_QUEUE_TIMEOUT_MS: u64 = 100;
const DEFAULT_LOG_CONFIRM_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LOG_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_LOG_PAGE_SIZE: usize = 256;
const DEFAULT_LOG_MAX_BATCHES_PER_CHUNK: usize = 64;
const DEFAULT_LOG_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(2);
const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024;
const DEFAULT_MAX_ADDRESS_RANGE: u64 = 1000;
const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_WATCHER_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_WATCHER_MAX_PARALLEL_BLOCKS: usize = 10;
const DEFAULT_WATCHER_MAX_BLOCKS_PER_CYCLE: u64 = 200;
const DEFAULT_CONFIRMER_POLL_INTERVAL_MS: u64 = 10_000;
const DEFAULT_KEY_DIR: &str = ".";
const DEFAULT_ORCHESTRATOR_INTERVAL_MS: u64 = 10_000;
const SIGNING_KEY_CURVE: &str = "ed25519";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let tokens = Arc::new(TokenRegistry::bundled()?);
    let signing_key = DistKeyConfig::load(&config.key_dir, SIGNING_KEY_CURVE)?;

    let (log, mut writer_handle, writer_stop) = SequencerLog::start(
        &config.log_db_path,
        &config.sqlite_synchronous,
        config.log,
    )?;

    let stop = StopSignal::new();
    let ledger_db = LedgerDb::open(&config.ledger_db_path, &config.sqlite_synchronous)?;
    let mut replay_handle = ReplayEngine::new(log.clone(), ledger_db, stop.clone()).spawn();
    let ledger = BlockingStorage::new(LedgerReader::open(
        &config.ledger_db_path,
        &config.sqlite_synchronous,
    )?);

    let solana: Arc<dyn ChainClient> = Arc::new(SolanaRpcClient::new(
        SolanaRpcConfig {
            url: config.solana_rpc_url.clone(),
            request_timeout: config.rpc_timeout,
        },
        tokens.for_chain(ChainId::Solana).to_vec(),
    )?);
    tokio::spawn(
        DepositWatcher::new(
            solana.clone(),
            log.clone(),
            ledger.clone(),
            DepositWatcherConfig {
                poll_interval: config.watcher_poll_interval,
                max_parallel_blocks: config.watcher_max_parallel_blocks,
                max_blocks_per_cycle: DEFAULT_WATCHER_MAX_BLOCKS_PER_CYCLE,
                start_height: config.sol_start_height,
                confirm_timeout: config.confirm_timeout,
            },
            stop.clone(),
        )
        .run(),
    );
    tokio::spawn(
        DepositConfirmer::new(
            solana,
            log.clone(),
            ledger.clone(),
            DepositConfirmerConfig {
                poll_interval: config.confirmer_poll_interval,
                confirm_timeout: config.confirm_timeout,
            },
            stop.clone(),
        )
        .run(),
    );

    let signer = Arc::new(HttpSigningService::new(
        &config.signing_service_url,
        config.rpc_timeout,
    )?);
    for chain in ChainId::ALL {
        tokio::spawn(
            WithdrawOrchestrator::new(
                signer.clone(),
                signing_key.clone(),
                log.clone(),
                ledger.clone(),
                WithdrawOrchestratorConfig {
                    chain,
                    interval: config.orchestrator_interval,
                    confirm_timeout: config.confirm_timeout,
                },
                stop.clone(),
            )
            .run(),
        );
    }

    let state = Arc::new(AppState {
        log,
        ledger,
        tokens,
        deriver: AddressDeriver {
            solana_program: config.solana_assetman.clone(),
            ton_assetman: config.ton_assetman.clone(),
        },
        confirm_timeout: config.confirm_timeout,
        max_address_range: config.max_address_range,
    });

    let app = custody::api::router(state, config.max_body_bytes);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;

    tracing::info!(address = %config.http_addr, "listening");
    tokio::select! {
        server_result = axum::serve(listener, app) => {
            stop.request_stop();
            writer_stop.request_shutdown();
            match writer_handle.await {
                Ok(LogWriterError::ShutdownRequested) => {}
                Ok(err) => return Err(format!("log writer exited during shutdown: {err}").into()),
                Err(join_err) => {
                    return Err(format!("log writer join error during shutdown: {join_err}").into())
                }
            }
            server_result?;
        }
        writer_result = &mut writer_handle => {
            stop.request_stop();
            match writer_result {
                Ok(err) => return Err(format!("log writer exited: {err}").into()),
                Err(join_err) => return Err(format!("log writer join error: {join_err}").into()),
            }
        }
        replay_result = &mut replay_handle => {
            stop.request_stop();
            writer_stop.request_shutdown();
            match replay_result {
                Ok(Ok(())) => return Err("replay engine stopped".into()),
                Ok(Err(err)) => return Err(format!("replay engine failed: {err}").into()),
                Err(join_err) => return Err(format!("replay engine join error: {join_err}").into()),
            }
        }
    }

    Ok(())
}

struct Config {
    http_addr: String,
    log_db_path: String,
    ledger_db_path: String,
    sqlite_synchronous: String,
    log: SequencerLogConfig,
    confirm_timeout: Duration,
    max_body_bytes: usize,
    max_address_range: u64,
    rpc_timeout: Duration,
    solana_rpc_url: String,
    solana_assetman: String,
    ton_assetman: String,
    watcher_poll_interval: Duration,
    watcher_max_parallel_blocks: usize,
    sol_start_height: Option<u64>,
    confirmer_poll_interval: Duration,
    signing_service_url: String,
    key_dir: PathBuf,
    orchestrator_interval: Duration,
}

impl Config {
    fn from_env() -> Result<Self, String> {
        Ok(Self {
            http_addr: env_string("CUSTODY_HTTP_ADDR", DEFAULT_HTTP_ADDR),
            log_db_path: env_string("CUSTODY_LOG_DB_PATH", DEFAULT_LOG_DB_PATH),
            ledger_db_path: env_string("CUSTODY_LEDGER_DB_PATH", DEFAULT_LEDGER_DB_PATH),
            sqlite_synchronous: env_string(
                "CUSTODY_SQLITE_SYNCHRONOUS",
                DEFAULT_SQLITE_SYNCHRONOUS,
            ),
            log: SequencerLogConfig {
                queue_capacity: env_usize("CUSTODY_LOG_QUEUE_CAP", DEFAULT_LOG_QUEUE_CAP).max(1),
                queue_timeout: env_millis(
                    "CUSTODY_LOG_QUEUE_TIMEOUT_MS",
                    DEFAULT_LOG_QUEUE_TIMEOUT_MS,
                ),
                poll_interval: env_millis(
                    "CUSTODY_LOG_POLL_INTERVAL_MS",
                    DEFAULT_LOG_POLL_INTERVAL_MS,
                ),
                page_size: DEFAULT_LOG_PAGE_SIZE,
                writer: LogWriterConfig {
                    max_batches_per_chunk: DEFAULT_LOG_MAX_BATCHES_PER_CHUNK,
                    idle_poll_interval: DEFAULT_LOG_IDLE_POLL_INTERVAL,
                },
            },
            confirm_timeout: env_millis(
                "CUSTODY_LOG_CONFIRM_TIMEOUT_MS",
                DEFAULT_LOG_CONFIRM_TIMEOUT_MS,
            ),
            max_body_bytes: env_usize("CUSTODY_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
            max_address_range: env_u64("CUSTODY_MAX_ADDRESS_RANGE", DEFAULT_MAX_ADDRESS_RANGE)
                .max(1),
            rpc_timeout: env_millis("CUSTODY_RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT_MS),
            solana_rpc_url: env_required("SOLANA_NODE_RPC")?,
            solana_assetman: env_required("SOLANA_ASSETMAN_ADDRESS")?,
            ton_assetman: env_required("TON_ASSETMAN_ADDRESS")?,
            watcher_poll_interval: env_millis(
                "CUSTODY_WATCHER_POLL_INTERVAL_MS",
                DEFAULT_WATCHER_POLL_INTERVAL_MS,
            ),
            watcher_max_parallel_blocks: env_usize(
                "CUSTODY_WATCHER_MAX_PARALLEL_BLOCKS",
                DEFAULT_WATCHER_MAX_PARALLEL_BLOCKS,
            )
            .max(1),
            sol_start_height: std::env::var("CUSTODY_SOL_START_HEIGHT")
                .ok()
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| format!("CUSTODY_SOL_START_HEIGHT is not a height: {value}"))
                })
                .transpose()?,
            confirmer_poll_interval: env_millis(
                "CUSTODY_CONFIRMER_POLL_INTERVAL_MS",
                DEFAULT_CONFIRMER_POLL_INTERVAL_MS,
            ),
            signing_service_url: env_required("CUSTODY_SIGNING_SERVICE_URL")?,
            key_dir: PathBuf::from(env_string("CUSTODY_KEY_DIR", DEFAULT_KEY_DIR)),
            orchestrator_interval: env_millis(
                "CUSTODY_ORCHESTRATOR_INTERVAL_MS",
                DEFAULT_ORCHESTRATOR_INTERVAL_MS,
            ),
        })
    }
}

fn env_required(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("{key} is required"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_u64(key, default).max(1))
}
