// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::Address;
use custody_core::{
    Agent, ApplyOutcome, ChainId, DecodedTransaction, Deposit, DepositAddress, InsertOutcome,
    LedgerSnapshot, LedgerStore, Withdraw, WithdrawStatus, replay_batch,
};
use rusqlite::{Connection, Result, TransactionBehavior};

use super::sql::{
    sql_insert_agent, sql_insert_deposit, sql_insert_deposit_address, sql_insert_withdraw,
    sql_select_agent, sql_select_agents, sql_select_agents_by_signer, sql_select_all_deposits,
    sql_select_all_withdraws, sql_select_deposit, sql_select_deposit_addresses,
    sql_select_deposits_by_confirmation, sql_select_deposits_by_owner, sql_select_replay_cursor,
    sql_select_withdraw, sql_select_withdraws_by_owner, sql_select_withdraws_by_status,
    sql_update_deposit_state, sql_update_replay_cursor, sql_update_withdraw_state,
};
use super::{StorageOpenError, i64_to_u64, open_with_migrations, u64_to_i64};

const MIGRATION_0001_SCHEMA: &str = include_str!("migrations/ledger/0001_schema.sql");

/// Selects the documents owned by one agent, optionally narrowed to an account and a user.
#[derive(Debug, Clone, Copy)]
pub struct OwnerFilter<'a> {
    pub agent: &'a str,
    pub account: Option<u64>,
    pub user: Option<u64>,
}

impl<'a> OwnerFilter<'a> {
    pub fn agent(agent: &'a str) -> Self {
        Self {
            agent,
            account: None,
            user: None,
        }
    }
}

/// `LedgerStore` over one open write transaction. Unique keys are enforced by the schema;
/// an ignored insert is reported as a duplicate.
struct LedgerView<'a> {
    conn: &'a Connection,
}

fn insert_outcome(changed_rows: usize) -> InsertOutcome {
    if changed_rows == 0 {
        InsertOutcome::Duplicate
    } else {
        InsertOutcome::Inserted
    }
}

fn expect_single_row(changed_rows: usize) -> Result<()> {
    if changed_rows != 1 {
        return Err(rusqlite::Error::StatementChangedRows(changed_rows));
    }
    Ok(())
}

impl LedgerStore for LedgerView<'_> {
    type Error = rusqlite::Error;

    fn insert_agent(&mut self, agent: &Agent) -> Result<InsertOutcome> {
        sql_insert_agent(self.conn, agent).map(insert_outcome)
    }

    fn insert_deposit_address(&mut self, address: &DepositAddress) -> Result<InsertOutcome> {
        sql_insert_deposit_address(self.conn, address).map(insert_outcome)
    }

    fn insert_deposit(&mut self, deposit: &Deposit) -> Result<InsertOutcome> {
        sql_insert_deposit(self.conn, deposit).map(insert_outcome)
    }

    fn find_deposit(&self, tx_hash: &str) -> Result<Option<Deposit>> {
        sql_select_deposit(self.conn, tx_hash)
    }

    fn update_deposit(&mut self, deposit: &Deposit) -> Result<()> {
        expect_single_row(sql_update_deposit_state(self.conn, deposit)?)
    }

    fn insert_withdraw(&mut self, withdraw: &Withdraw) -> Result<InsertOutcome> {
        sql_insert_withdraw(self.conn, withdraw).map(insert_outcome)
    }

    fn find_withdraw(&self, id: &str) -> Result<Option<Withdraw>> {
        sql_select_withdraw(self.conn, id)
    }

    fn update_withdraw(&mut self, withdraw: &Withdraw) -> Result<()> {
        expect_single_row(sql_update_withdraw_state(self.conn, withdraw)?)
    }
}

/// Write side of the ledger. Owned by the replay engine only.
pub struct LedgerDb {
    conn: Connection,
}

impl LedgerDb {
    pub fn open(path: &str, synchronous: &str) -> std::result::Result<Self, StorageOpenError> {
        let conn = open_with_migrations(path, synchronous, &[MIGRATION_0001_SCHEMA])?;
        Ok(Self { conn })
    }

    /// Index of the next log batch to apply.
    pub fn next_index(&self) -> Result<u64> {
        Ok(i64_to_u64(sql_select_replay_cursor(&self.conn)?))
    }

    /// Applies one batch and advances the cursor past it in a single transaction.
    /// Returns `None` when the batch is below the cursor, i.e. it was already applied.
    pub fn apply_batch(
        &mut self,
        batch_index: u64,
        txs: &[DecodedTransaction],
    ) -> Result<Option<Vec<ApplyOutcome>>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next_index = i64_to_u64(sql_select_replay_cursor(&tx)?);
        if batch_index < next_index {
            return Ok(None);
        }
        assert_eq!(
            batch_index, next_index,
            "replay gap: expected batch {next_index}, got {batch_index}"
        );

        let outcomes = replay_batch(&mut LedgerView { conn: &tx }, batch_index, txs)?;
        expect_single_row(sql_update_replay_cursor(
            &tx,
            u64_to_i64(batch_index.saturating_add(1))?,
        )?)?;
        tx.commit()?;
        Ok(Some(outcomes))
    }
}

/// Read side of the ledger, used by the API and the chain workers.
pub struct LedgerReader {
    conn: Connection,
}

impl LedgerReader {
    pub fn open(path: &str, synchronous: &str) -> std::result::Result<Self, StorageOpenError> {
        let conn = open_with_migrations(path, synchronous, &[MIGRATION_0001_SCHEMA])?;
        Ok(Self { conn })
    }

    pub fn next_index(&self) -> Result<u64> {
        Ok(i64_to_u64(sql_select_replay_cursor(&self.conn)?))
    }

    pub fn agent(&self, id: &str) -> Result<Option<Agent>> {
        sql_select_agent(&self.conn, id)
    }

    pub fn agents_for_signer(&self, signer: &Address) -> Result<Vec<Agent>> {
        sql_select_agents_by_signer(&self.conn, signer)
    }

    pub fn deposit_addresses(
        &self,
        agent: Option<&str>,
        chain: Option<ChainId>,
    ) -> Result<Vec<DepositAddress>> {
        sql_select_deposit_addresses(&self.conn, agent, chain, None)
    }

    pub fn active_deposit_addresses(&self, chain: ChainId) -> Result<Vec<DepositAddress>> {
        sql_select_deposit_addresses(&self.conn, None, Some(chain), Some(true))
    }

    pub fn deposits(&self, owner: OwnerFilter<'_>) -> Result<Vec<Deposit>> {
        sql_select_deposits_by_owner(&self.conn, owner.agent, owner.account, owner.user)
    }

    pub fn unconfirmed_deposits(&self, chain: ChainId) -> Result<Vec<Deposit>> {
        sql_select_deposits_by_confirmation(&self.conn, chain, false)
    }

    pub fn withdraws(
        &self,
        owner: OwnerFilter<'_>,
        status: Option<WithdrawStatus>,
    ) -> Result<Vec<Withdraw>> {
        sql_select_withdraws_by_owner(&self.conn, owner.agent, owner.account, owner.user, status)
    }

    pub fn withdraws_with_status(
        &self,
        target_chain: ChainId,
        status: WithdrawStatus,
    ) -> Result<Vec<Withdraw>> {
        sql_select_withdraws_by_status(&self.conn, target_chain, status)
    }

    /// Full ledger in canonical order. Reads inside one transaction so the cursor and the
    /// collections come from the same point in the log.
    pub fn snapshot(&mut self) -> Result<LedgerSnapshot> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        let snapshot = LedgerSnapshot {
            next_index: i64_to_u64(sql_select_replay_cursor(&tx)?),
            agents: sql_select_agents(&tx)?,
            deposit_addresses: sql_select_deposit_addresses(&tx, None, None, None)?,
            deposits: sql_select_all_deposits(&tx)?,
            withdraws: sql_select_all_withdraws(&tx)?,
        };
        tx.commit()?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::{LedgerDb, LedgerReader, OwnerFilter, u64_to_i64};
    use alloy_primitives::Address;
    use custody_core::transaction::{
        AddWithdraw, AgentRegister, ApproveWithdraw, ConfirmDeposit, CreateDepositAddress,
        DepositPayload, TransferWithdraw,
    };
    use custody_core::{
        ChainId, DecodedTransaction, DepositToken, MAX_LEDGER_INTEGER, MemoryLedger, TokenInfo,
        Transaction, WithdrawStatus,
    };
    use tempfile::TempDir;

    struct TestLedger {
        _dir: TempDir,
        path: String,
    }

    fn temp_ledger() -> TestLedger {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("ledger.sqlite");
        TestLedger {
            path: path.to_string_lossy().into_owned(),
            _dir: dir,
        }
    }

    fn known(txs: Vec<Transaction>) -> Vec<DecodedTransaction> {
        txs.into_iter().map(DecodedTransaction::Known).collect()
    }

    fn sample_log() -> Vec<Vec<Transaction>> {
        let signers = [Address::from_slice(&[0xaa; 20]), Address::from_slice(&[0xbb; 20])]
            .into_iter()
            .collect();
        let address = |user: u64, address: &str| {
            Transaction::CreateDepositAddress(CreateDepositAddress {
                agent: "a1".to_string(),
                account: 0,
                chain: ChainId::Solana,
                user,
                address: address.to_string(),
                memo: None,
            })
        };
        let deposit = |tx_hash: &str, block: u64| {
            Transaction::Deposit(DepositPayload {
                chain: ChainId::Solana,
                block,
                tx_hash: tx_hash.to_string(),
                agent: "a1".to_string(),
                account: 0,
                user: 7,
                address: "X".to_string(),
                memo: None,
                token: DepositToken {
                    symbol: "SOL".to_string(),
                    contract: None,
                    amount: 2_500_000_000,
                    decimals: 9,
                },
            })
        };
        let withdraw = |id: &str| {
            Transaction::AddWithdraw(AddWithdraw {
                id: id.to_string(),
                agent: "a1".to_string(),
                account: None,
                user: None,
                signatures: vec!["0x01".to_string()],
                token: TokenInfo {
                    symbol: "SOL".to_string(),
                    name: None,
                    contract: None,
                    decimals: 9,
                },
                target_chain: ChainId::Solana,
                amount: 10,
                to_address: "Dest".to_string(),
            })
        };
        vec![
            vec![Transaction::AgentRegister(AgentRegister {
                signers,
                threshold: 1,
            })],
            vec![address(7, "X"), address(7, "X-dup"), address(8, "Y")],
            vec![deposit("h1", 4), deposit("h1", 4), deposit("h2", 9)],
            vec![withdraw("w1"), withdraw("w2")],
            vec![Transaction::ApproveWithdraw(ApproveWithdraw {
                id: "w1".to_string(),
                avs_verifying_key: "pk".to_string(),
                avs_signature: "sig".to_string(),
                non_signers: vec![],
            })],
            vec![
                Transaction::ConfirmDeposit(ConfirmDeposit {
                    tx_hash: "h1".to_string(),
                    finalized_height: 5,
                }),
                Transaction::ConfirmDeposit(ConfirmDeposit {
                    tx_hash: "h2".to_string(),
                    finalized_height: 5,
                }),
                Transaction::TransferWithdraw(TransferWithdraw {
                    withdraws: vec!["w1".to_string()],
                    tx_hash: "t1".to_string(),
                }),
            ],
        ]
    }

    fn replay_into(path: &str, log: &[Vec<Transaction>]) {
        let mut db = LedgerDb::open(path, "NORMAL").expect("open ledger");
        for (index, batch) in log.iter().enumerate() {
            db.apply_batch(index as u64, &known(batch.clone()))
                .expect("apply batch")
                .expect("batch applied once");
        }
    }

    #[test]
    fn sqlite_replay_matches_in_memory_replay() {
        let log = sample_log();
        let ledger = temp_ledger();
        replay_into(&ledger.path, &log);

        let mut memory = MemoryLedger::new();
        for (index, batch) in log.iter().enumerate() {
            memory.apply_batch(index as u64, &known(batch.clone()));
        }

        let mut reader = LedgerReader::open(&ledger.path, "NORMAL").expect("open reader");
        let stored = reader.snapshot().expect("snapshot");
        assert_eq!(stored, memory.snapshot());
        assert_eq!(stored.to_canonical_json(), memory.snapshot().to_canonical_json());
    }

    #[test]
    fn two_fresh_stores_replay_to_identical_snapshots() {
        let log = sample_log();
        let first = temp_ledger();
        let second = temp_ledger();
        replay_into(&first.path, &log);
        replay_into(&second.path, &log);

        let a = LedgerReader::open(&first.path, "NORMAL")
            .expect("open")
            .snapshot()
            .expect("snapshot");
        let b = LedgerReader::open(&second.path, "NORMAL")
            .expect("open")
            .snapshot()
            .expect("snapshot");
        assert_eq!(a.to_canonical_json(), b.to_canonical_json());
    }

    #[test]
    fn applied_batches_are_skipped_after_restart() {
        let log = sample_log();
        let ledger = temp_ledger();
        replay_into(&ledger.path, &log);

        let mut reopened = LedgerDb::open(&ledger.path, "NORMAL").expect("reopen");
        assert_eq!(reopened.next_index().expect("cursor"), log.len() as u64);
        let skipped = reopened
            .apply_batch(2, &known(log[2].clone()))
            .expect("apply old batch");
        assert!(skipped.is_none());

        let reader = LedgerReader::open(&ledger.path, "NORMAL").expect("open reader");
        let deposits = reader.deposits(OwnerFilter::agent("a1")).expect("deposits");
        assert_eq!(deposits.len(), 2);
    }

    #[test]
    fn reader_queries_follow_the_ledger_state() {
        let log = sample_log();
        let ledger = temp_ledger();
        replay_into(&ledger.path, &log);
        let reader = LedgerReader::open(&ledger.path, "NORMAL").expect("open reader");

        let addresses = reader
            .deposit_addresses(Some("a1"), Some(ChainId::Solana))
            .expect("addresses");
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].user, 7);
        assert_eq!(addresses[0].address, "X");

        assert!(reader
            .unconfirmed_deposits(ChainId::Solana)
            .expect("unconfirmed")
            .iter()
            .all(|d| d.tx_hash == "h2"));

        let signer = Address::from_slice(&[0xbb; 20]);
        let agents = reader.agents_for_signer(&signer).expect("agents");
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].threshold, 1);
        assert!(reader.agent(&agents[0].id).expect("agent").is_some());

        let transferred = reader
            .withdraws(OwnerFilter::agent("a1"), Some(WithdrawStatus::Transferred))
            .expect("withdraws");
        assert_eq!(transferred.len(), 1);
        assert_eq!(transferred[0].transfer_tx.as_deref(), Some("t1"));

        let pending = reader
            .withdraws_with_status(ChainId::Solana, WithdrawStatus::Initialized)
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "w2");
    }

    #[test]
    fn out_of_range_users_are_ignored_by_both_stores() {
        let address = |user: u64, address: &str| {
            Transaction::CreateDepositAddress(CreateDepositAddress {
                agent: "a1".to_string(),
                account: 0,
                chain: ChainId::Solana,
                user,
                address: address.to_string(),
                memo: None,
            })
        };
        let batch = known(vec![
            address(u64::MAX, "A"),
            address(u64::MAX - 1, "B"),
            address(MAX_LEDGER_INTEGER, "C"),
        ]);

        let ledger = temp_ledger();
        let mut db = LedgerDb::open(&ledger.path, "NORMAL").expect("open ledger");
        let outcomes = db
            .apply_batch(0, &batch)
            .expect("apply batch")
            .expect("batch applied once");
        assert!(outcomes[0].is_noop());
        assert!(outcomes[1].is_noop());
        assert_eq!(outcomes[2].applied, 1);

        let mut memory = MemoryLedger::new();
        memory.apply_batch(0, &batch);

        let stored = LedgerReader::open(&ledger.path, "NORMAL")
            .expect("open reader")
            .snapshot()
            .expect("snapshot");
        assert_eq!(stored, memory.snapshot());
        assert_eq!(stored.deposit_addresses.len(), 1);
        assert_eq!(stored.deposit_addresses[0].user, MAX_LEDGER_INTEGER);
    }

    #[test]
    fn unrepresentable_integers_fail_the_statement() {
        assert_eq!(u64_to_i64(MAX_LEDGER_INTEGER).expect("fits"), i64::MAX);
        assert!(matches!(
            u64_to_i64(u64::MAX),
            Err(rusqlite::Error::ToSqlConversionFailure(_))
        ));
    }
}
