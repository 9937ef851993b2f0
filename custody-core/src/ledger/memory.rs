// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::convert::Infallible;

use super::{InsertOutcome, LedgerSnapshot, LedgerStore, replay_batch};
use crate::entities::{AddressSlot, Agent, Deposit, DepositAddress, Withdraw};
use crate::transaction::DecodedTransaction;

/// In-process ledger, keyed the same way as the durable store.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    next_index: u64,
    agents: BTreeMap<String, Agent>,
    deposit_addresses: BTreeMap<AddressSlot, DepositAddress>,
    deposits: BTreeMap<String, Deposit>,
    withdraws: BTreeMap<String, Withdraw>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Applies the batch at `batch_index` and advances the cursor past it. Batches at or
    /// below the cursor were already applied and are skipped.
    pub fn apply_batch(&mut self, batch_index: u64, txs: &[DecodedTransaction]) -> bool {
        if batch_index < self.next_index {
            return false;
        }
        match replay_batch(self, batch_index, txs) {
            Ok(_) => {}
            Err(never) => match never {},
        }
        self.next_index = batch_index.saturating_add(1);
        true
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn deposit_addresses(&self) -> impl Iterator<Item = &DepositAddress> {
        self.deposit_addresses.values()
    }

    pub fn deposits(&self) -> impl Iterator<Item = &Deposit> {
        self.deposits.values()
    }

    pub fn withdraws(&self) -> impl Iterator<Item = &Withdraw> {
        self.withdraws.values()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            next_index: self.next_index,
            agents: self.agents.values().cloned().collect(),
            deposit_addresses: self.deposit_addresses.values().cloned().collect(),
            deposits: self.deposits.values().cloned().collect(),
            withdraws: self.withdraws.values().cloned().collect(),
        }
    }
}

fn insert_unique<K: Ord, V: Clone>(map: &mut BTreeMap<K, V>, key: K, value: &V) -> InsertOutcome {
    match map.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(value.clone());
            InsertOutcome::Inserted
        }
        Entry::Occupied(_) => InsertOutcome::Duplicate,
    }
}

impl LedgerStore for MemoryLedger {
    type Error = Infallible;

    fn insert_agent(&mut self, agent: &Agent) -> Result<InsertOutcome, Self::Error> {
        Ok(insert_unique(&mut self.agents, agent.id.clone(), agent))
    }

    fn insert_deposit_address(
        &mut self,
        address: &DepositAddress,
    ) -> Result<InsertOutcome, Self::Error> {
        Ok(insert_unique(
            &mut self.deposit_addresses,
            address.slot(),
            address,
        ))
    }

    fn insert_deposit(&mut self, deposit: &Deposit) -> Result<InsertOutcome, Self::Error> {
        Ok(insert_unique(
            &mut self.deposits,
            deposit.tx_hash.clone(),
            deposit,
        ))
    }

    fn find_deposit(&self, tx_hash: &str) -> Result<Option<Deposit>, Self::Error> {
        Ok(self.deposits.get(tx_hash).cloned())
    }

    fn update_deposit(&mut self, deposit: &Deposit) -> Result<(), Self::Error> {
        self.deposits
            .insert(deposit.tx_hash.clone(), deposit.clone());
        Ok(())
    }

    fn insert_withdraw(&mut self, withdraw: &Withdraw) -> Result<InsertOutcome, Self::Error> {
        Ok(insert_unique(&mut self.withdraws, withdraw.id.clone(), withdraw))
    }

    fn find_withdraw(&self, id: &str) -> Result<Option<Withdraw>, Self::Error> {
        Ok(self.withdraws.get(id).cloned())
    }

    fn update_withdraw(&mut self, withdraw: &Withdraw) -> Result<(), Self::Error> {
        self.withdraws.insert(withdraw.id.clone(), withdraw.clone());
        Ok(())
    }
}
