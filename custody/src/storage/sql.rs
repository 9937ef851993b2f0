// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeSet;

use alloy_primitives::{Address, hex};
use custody_core::{
    Agent, AvsSignature, ChainId, Deposit, DepositAddress, DepositToken, TokenInfo, Withdraw,
    WithdrawStatus,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{i64_to_u64, u64_to_i64};

// ----- log -----------------------------------------------------------------

const SQL_SELECT_BATCH_INDEX_BY_CORRELATION: &str =
    "SELECT batch_index FROM log_batches WHERE correlation_id = ?1";
const SQL_SELECT_NEXT_BATCH_INDEX: &str =
    "SELECT COALESCE(MAX(batch_index) + 1, 0) FROM log_batches";
const SQL_INSERT_BATCH: &str = "INSERT INTO log_batches (batch_index, correlation_id, payload, appended_at_ms) VALUES (?1, ?2, ?3, ?4)";
const SQL_SELECT_BATCHES_FROM: &str = "SELECT batch_index, correlation_id, payload FROM log_batches WHERE batch_index >= ?1 ORDER BY batch_index ASC LIMIT ?2";
const SQL_SELECT_SCAN_CURSOR: &str =
    "SELECT last_scanned_height FROM scan_cursors WHERE chain = ?1";
const SQL_UPSERT_SCAN_CURSOR: &str = "INSERT INTO scan_cursors (chain, last_scanned_height) VALUES (?1, ?2) ON CONFLICT (chain) DO UPDATE SET last_scanned_height = excluded.last_scanned_height";

#[derive(Debug, Clone)]
pub(super) struct BatchRow {
    pub batch_index: i64,
    pub correlation_id: String,
    pub payload: String,
}

pub(super) fn sql_select_batch_index_by_correlation(
    conn: &Connection,
    correlation_id: &str,
) -> Result<Option<i64>> {
    conn.query_row(
        SQL_SELECT_BATCH_INDEX_BY_CORRELATION,
        params![correlation_id],
        |row| row.get(0),
    )
    .optional()
}

pub(super) fn sql_select_next_batch_index(conn: &Connection) -> Result<i64> {
    conn.query_row(SQL_SELECT_NEXT_BATCH_INDEX, [], |row| row.get(0))
}

pub(super) fn sql_insert_batch(
    conn: &Connection,
    batch_index: i64,
    correlation_id: &str,
    payload: &str,
    appended_at_ms: i64,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(SQL_INSERT_BATCH)?;
    stmt.execute(params![batch_index, correlation_id, payload, appended_at_ms])?;
    Ok(())
}

pub(super) fn sql_select_batches_from(
    conn: &Connection,
    from_inclusive: i64,
    limit: i64,
) -> Result<Vec<BatchRow>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_BATCHES_FROM)?;
    let mapped = stmt.query_map(params![from_inclusive, limit], |row| {
        Ok(BatchRow {
            batch_index: row.get(0)?,
            correlation_id: row.get(1)?,
            payload: row.get(2)?,
        })
    })?;
    mapped.collect()
}

pub(super) fn sql_select_scan_cursor(conn: &Connection, chain: ChainId) -> Result<Option<i64>> {
    conn.query_row(SQL_SELECT_SCAN_CURSOR, params![chain.as_str()], |row| {
        row.get(0)
    })
    .optional()
}

pub(super) fn sql_upsert_scan_cursor(conn: &Connection, chain: ChainId, height: i64) -> Result<()> {
    conn.execute(SQL_UPSERT_SCAN_CURSOR, params![chain.as_str(), height])?;
    Ok(())
}

// ----- ledger --------------------------------------------------------------

const SQL_SELECT_REPLAY_CURSOR: &str =
    "SELECT next_index FROM replay_cursor WHERE singleton_id = 0";
const SQL_UPDATE_REPLAY_CURSOR: &str =
    "UPDATE replay_cursor SET next_index = ?1 WHERE singleton_id = 0";

const SQL_INSERT_AGENT: &str =
    "INSERT OR IGNORE INTO agents (id, threshold, signers) VALUES (?1, ?2, ?3)";
const SQL_INSERT_AGENT_SIGNER: &str =
    "INSERT OR IGNORE INTO agent_signers (agent_id, signer) VALUES (?1, ?2)";
const SQL_AGENT_COLUMNS: &str = "SELECT id, threshold, signers FROM agents";
const SQL_SELECT_AGENTS_BY_SIGNER: &str = "SELECT a.id, a.threshold, a.signers FROM agents a JOIN agent_signers s ON s.agent_id = a.id WHERE s.signer = ?1 ORDER BY a.id";

const SQL_INSERT_DEPOSIT_ADDRESS: &str = "INSERT OR IGNORE INTO deposit_addresses (agent, account, chain, user, address, memo, active) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";
const SQL_SELECT_DEPOSIT_ADDRESSES: &str = "SELECT agent, account, chain, user, address, memo, active FROM deposit_addresses WHERE (?1 IS NULL OR agent = ?1) AND (?2 IS NULL OR chain = ?2) AND (?3 IS NULL OR active = ?3) ORDER BY agent, account, chain, user";

const SQL_INSERT_DEPOSIT: &str = "INSERT OR IGNORE INTO deposits (tx_hash, chain, block, agent, account, user, address, memo, token_symbol, token_contract, amount, decimals, confirmed, transferred, transfer_tx) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)";
const SQL_UPDATE_DEPOSIT_STATE: &str =
    "UPDATE deposits SET confirmed = ?2, transferred = ?3, transfer_tx = ?4 WHERE tx_hash = ?1";
const SQL_DEPOSIT_COLUMNS: &str = "SELECT tx_hash, chain, block, agent, account, user, address, memo, token_symbol, token_contract, amount, decimals, confirmed, transferred, transfer_tx FROM deposits";

const SQL_INSERT_WITHDRAW: &str = "INSERT OR IGNORE INTO withdraws (id, agent, account, user, signatures, token, target_chain, amount, to_address, status, avs_signature, transfer_tx) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";
const SQL_UPDATE_WITHDRAW_STATE: &str =
    "UPDATE withdraws SET status = ?2, avs_signature = ?3, transfer_tx = ?4 WHERE id = ?1";
const SQL_WITHDRAW_COLUMNS: &str = "SELECT id, agent, account, user, signatures, token, target_chain, amount, to_address, status, avs_signature, transfer_tx FROM withdraws";

pub(super) fn sql_select_replay_cursor(conn: &Connection) -> Result<i64> {
    conn.query_row(SQL_SELECT_REPLAY_CURSOR, [], |row| row.get(0))
}

pub(super) fn sql_update_replay_cursor(conn: &Connection, next_index: i64) -> Result<usize> {
    conn.execute(SQL_UPDATE_REPLAY_CURSOR, params![next_index])
}

/// Returns the number of inserted rows: 0 when the id already exists.
pub(super) fn sql_insert_agent(conn: &Connection, agent: &Agent) -> Result<usize> {
    let signers = to_json_text(&agent.signers)?;
    let inserted = conn.execute(
        SQL_INSERT_AGENT,
        params![agent.id, i64::from(agent.threshold), signers],
    )?;
    if inserted == 1 {
        let mut stmt = conn.prepare_cached(SQL_INSERT_AGENT_SIGNER)?;
        for signer in &agent.signers {
            stmt.execute(params![agent.id, signer_key(signer)])?;
        }
    }
    Ok(inserted)
}

pub(super) fn sql_select_agent(conn: &Connection, id: &str) -> Result<Option<Agent>> {
    let sql = format!("{SQL_AGENT_COLUMNS} WHERE id = ?1");
    conn.query_row(&sql, params![id], convert_row_to_agent)
        .optional()
}

pub(super) fn sql_select_agents(conn: &Connection) -> Result<Vec<Agent>> {
    let sql = format!("{SQL_AGENT_COLUMNS} ORDER BY id");
    let mut stmt = conn.prepare_cached(&sql)?;
    let mapped = stmt.query_map([], convert_row_to_agent)?;
    mapped.collect()
}

pub(super) fn sql_select_agents_by_signer(conn: &Connection, signer: &Address) -> Result<Vec<Agent>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_AGENTS_BY_SIGNER)?;
    let mapped = stmt.query_map(params![signer_key(signer)], convert_row_to_agent)?;
    mapped.collect()
}

pub(super) fn sql_insert_deposit_address(
    conn: &Connection,
    address: &DepositAddress,
) -> Result<usize> {
    conn.execute(
        SQL_INSERT_DEPOSIT_ADDRESS,
        params![
            address.agent,
            u64_to_i64(address.account)?,
            address.chain.as_str(),
            u64_to_i64(address.user)?,
            address.address,
            address.memo,
            address.active,
        ],
    )
}

pub(super) fn sql_select_deposit_addresses(
    conn: &Connection,
    agent: Option<&str>,
    chain: Option<ChainId>,
    active: Option<bool>,
) -> Result<Vec<DepositAddress>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_DEPOSIT_ADDRESSES)?;
    let mapped = stmt.query_map(
        params![agent, chain.map(|value| value.as_str()), active],
        convert_row_to_deposit_address,
    )?;
    mapped.collect()
}

pub(super) fn sql_insert_deposit(conn: &Connection, deposit: &Deposit) -> Result<usize> {
    conn.execute(
        SQL_INSERT_DEPOSIT,
        params![
            deposit.tx_hash,
            deposit.chain.as_str(),
            u64_to_i64(deposit.block)?,
            deposit.agent,
            u64_to_i64(deposit.account)?,
            u64_to_i64(deposit.user)?,
            deposit.address,
            deposit.memo,
            deposit.token.symbol,
            deposit.token.contract,
            deposit.token.amount.to_string(),
            i64::from(deposit.token.decimals),
            deposit.confirmed,
            deposit.transferred,
            deposit.transfer_tx,
        ],
    )
}

pub(super) fn sql_update_deposit_state(conn: &Connection, deposit: &Deposit) -> Result<usize> {
    conn.execute(
        SQL_UPDATE_DEPOSIT_STATE,
        params![
            deposit.tx_hash,
            deposit.confirmed,
            deposit.transferred,
            deposit.transfer_tx,
        ],
    )
}

pub(super) fn sql_select_deposit(conn: &Connection, tx_hash: &str) -> Result<Option<Deposit>> {
    let sql = format!("{SQL_DEPOSIT_COLUMNS} WHERE tx_hash = ?1");
    conn.query_row(&sql, params![tx_hash], convert_row_to_deposit)
        .optional()
}

pub(super) fn sql_select_deposits_by_owner(
    conn: &Connection,
    agent: &str,
    account: Option<u64>,
    user: Option<u64>,
) -> Result<Vec<Deposit>> {
    let sql = format!(
        "{SQL_DEPOSIT_COLUMNS} WHERE agent = ?1 AND (?2 IS NULL OR account = ?2) AND (?3 IS NULL OR user = ?3) ORDER BY block, tx_hash"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mapped = stmt.query_map(
        params![
            agent,
            account.map(u64_to_i64).transpose()?,
            user.map(u64_to_i64).transpose()?,
        ],
        convert_row_to_deposit,
    )?;
    mapped.collect()
}

pub(super) fn sql_select_deposits_by_confirmation(
    conn: &Connection,
    chain: ChainId,
    confirmed: bool,
) -> Result<Vec<Deposit>> {
    let sql = format!(
        "{SQL_DEPOSIT_COLUMNS} WHERE chain = ?1 AND confirmed = ?2 ORDER BY block, tx_hash"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mapped = stmt.query_map(params![chain.as_str(), confirmed], convert_row_to_deposit)?;
    mapped.collect()
}

pub(super) fn sql_select_all_deposits(conn: &Connection) -> Result<Vec<Deposit>> {
    let sql = format!("{SQL_DEPOSIT_COLUMNS} ORDER BY tx_hash");
    let mut stmt = conn.prepare_cached(&sql)?;
    let mapped = stmt.query_map([], convert_row_to_deposit)?;
    mapped.collect()
}

pub(super) fn sql_insert_withdraw(conn: &Connection, withdraw: &Withdraw) -> Result<usize> {
    conn.execute(
        SQL_INSERT_WITHDRAW,
        params![
            withdraw.id,
            withdraw.agent,
            withdraw.account.map(u64_to_i64).transpose()?,
            withdraw.user.map(u64_to_i64).transpose()?,
            to_json_text(&withdraw.signatures)?,
            to_json_text(&withdraw.token)?,
            withdraw.target_chain.as_str(),
            withdraw.amount.to_string(),
            withdraw.to_address,
            withdraw.status.as_str(),
            optional_json_text(withdraw.avs_signature.as_ref())?,
            withdraw.transfer_tx,
        ],
    )
}

pub(super) fn sql_update_withdraw_state(conn: &Connection, withdraw: &Withdraw) -> Result<usize> {
    conn.execute(
        SQL_UPDATE_WITHDRAW_STATE,
        params![
            withdraw.id,
            withdraw.status.as_str(),
            optional_json_text(withdraw.avs_signature.as_ref())?,
            withdraw.transfer_tx,
        ],
    )
}

pub(super) fn sql_select_withdraw(conn: &Connection, id: &str) -> Result<Option<Withdraw>> {
    let sql = format!("{SQL_WITHDRAW_COLUMNS} WHERE id = ?1");
    conn.query_row(&sql, params![id], convert_row_to_withdraw)
        .optional()
}

pub(super) fn sql_select_withdraws_by_owner(
    conn: &Connection,
    agent: &str,
    account: Option<u64>,
    user: Option<u64>,
    status: Option<WithdrawStatus>,
) -> Result<Vec<Withdraw>> {
    let sql = format!(
        "{SQL_WITHDRAW_COLUMNS} WHERE agent = ?1 AND (?2 IS NULL OR account = ?2) AND (?3 IS NULL OR user = ?3) AND (?4 IS NULL OR status = ?4) ORDER BY rowid"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mapped = stmt.query_map(
        params![
            agent,
            account.map(u64_to_i64).transpose()?,
            user.map(u64_to_i64).transpose()?,
            status.map(|value| value.as_str()),
        ],
        convert_row_to_withdraw,
    )?;
    mapped.collect()
}

pub(super) fn sql_select_withdraws_by_status(
    conn: &Connection,
    target_chain: ChainId,
    status: WithdrawStatus,
) -> Result<Vec<Withdraw>> {
    let sql = format!("{SQL_WITHDRAW_COLUMNS} WHERE target_chain = ?1 AND status = ?2 ORDER BY rowid");
    let mut stmt = conn.prepare_cached(&sql)?;
    let mapped = stmt.query_map(
        params![target_chain.as_str(), status.as_str()],
        convert_row_to_withdraw,
    )?;
    mapped.collect()
}

pub(super) fn sql_select_all_withdraws(conn: &Connection) -> Result<Vec<Withdraw>> {
    let sql = format!("{SQL_WITHDRAW_COLUMNS} ORDER BY id");
    let mut stmt = conn.prepare_cached(&sql)?;
    let mapped = stmt.query_map([], convert_row_to_withdraw)?;
    mapped.collect()
}

fn convert_row_to_agent(row: &Row<'_>) -> Result<Agent> {
    let signers: BTreeSet<Address> = from_json_column(row, 2)?;
    Ok(Agent {
        id: row.get(0)?,
        threshold: u32::try_from(row.get::<_, i64>(1)?).unwrap_or(u32::MAX),
        signers,
    })
}

fn convert_row_to_deposit_address(row: &Row<'_>) -> Result<DepositAddress> {
    Ok(DepositAddress {
        agent: row.get(0)?,
        account: i64_to_u64(row.get(1)?),
        chain: chain_column(row, 2)?,
        user: i64_to_u64(row.get(3)?),
        address: row.get(4)?,
        memo: row.get(5)?,
        active: row.get(6)?,
    })
}

fn convert_row_to_deposit(row: &Row<'_>) -> Result<Deposit> {
    Ok(Deposit {
        tx_hash: row.get(0)?,
        chain: chain_column(row, 1)?,
        block: i64_to_u64(row.get(2)?),
        agent: row.get(3)?,
        account: i64_to_u64(row.get(4)?),
        user: i64_to_u64(row.get(5)?),
        address: row.get(6)?,
        memo: row.get(7)?,
        token: DepositToken {
            symbol: row.get(8)?,
            contract: row.get(9)?,
            amount: amount_column(row, 10)?,
            decimals: u8::try_from(row.get::<_, i64>(11)?).unwrap_or(u8::MAX),
        },
        confirmed: row.get(12)?,
        transferred: row.get(13)?,
        transfer_tx: row.get(14)?,
    })
}

fn convert_row_to_withdraw(row: &Row<'_>) -> Result<Withdraw> {
    let signatures: Vec<String> = from_json_column(row, 4)?;
    let token: TokenInfo = from_json_column(row, 5)?;
    let avs_signature: Option<AvsSignature> = match row.get::<_, Option<String>>(10)? {
        Some(text) => Some(
            serde_json::from_str(&text)
                .map_err(|err| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(err)))?,
        ),
        None => None,
    };
    let status_text: String = row.get(9)?;
    let status = status_text.parse::<WithdrawStatus>().map_err(|reason| {
        rusqlite::Error::FromSqlConversionFailure(9, Type::Text, reason.into())
    })?;
    Ok(Withdraw {
        id: row.get(0)?,
        agent: row.get(1)?,
        account: row.get::<_, Option<i64>>(2)?.map(i64_to_u64),
        user: row.get::<_, Option<i64>>(3)?.map(i64_to_u64),
        signatures,
        token,
        target_chain: chain_column(row, 6)?,
        amount: amount_column(row, 7)?,
        to_address: row.get(8)?,
        status,
        avs_signature,
        transfer_tx: row.get(11)?,
    })
}

fn chain_column(row: &Row<'_>, idx: usize) -> Result<ChainId> {
    let text: String = row.get(idx)?;
    text.parse::<ChainId>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn amount_column(row: &Row<'_>, idx: usize) -> Result<u128> {
    let text: String = row.get(idx)?;
    text.parse::<u128>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn from_json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn to_json_text<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
}

fn optional_json_text<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(to_json_text).transpose()
}

fn signer_key(signer: &Address) -> String {
    hex::encode_prefixed(signer.as_slice())
}
