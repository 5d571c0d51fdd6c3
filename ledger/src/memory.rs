//! In-process ledger store.
//!
//! Each account lives behind its own mutex. A commit clones the handles of
//! the touched accounts, locks them in ascending id order, verifies every
//! precondition and only then writes, so a batch is applied completely or
//! not at all and opposite-direction transfers cannot deadlock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use corebank_common::{now, AccountId, TransactionId, TransactionStatus};

use crate::account::{Account, AccountStatus};
use crate::journal::JournalEntry;
use crate::store::{Claim, CommitBatch, LedgerStore, StoreError, StoreResult};
use crate::transaction::Transaction;

/// Ledger store kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<AccountId, Arc<Mutex<Account>>>,
    transactions: DashMap<TransactionId, Transaction>,
    journal: DashMap<TransactionId, Vec<JournalEntry>>,
    /// Guards transaction records between a check and the write that
    /// depends on it. Always taken after any account lock.
    records: Mutex<()>,
    unavailable: AtomicBool,
    injected_conflicts: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage outage: every call fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` balance-changing commits fail with a version conflict.
    pub fn inject_version_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of transaction records, including PENDING claims.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn handle(&self, id: &AccountId) -> StoreResult<Arc<Mutex<Account>>> {
        self.accounts
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StoreError::AccountNotFound(*id))
    }

    fn expect_status(&self, id: &TransactionId, status: TransactionStatus) -> StoreResult<()> {
        match self.transactions.get(id) {
            Some(record) if record.status == status => Ok(()),
            _ => Err(StoreError::TransactionConflict { id: id.clone() }),
        }
    }

    /// The stored record must still be the PENDING claim `transaction` came from.
    fn expect_claim(&self, transaction: &Transaction) -> StoreResult<()> {
        match self.transactions.get(&transaction.id) {
            Some(record)
                if record.status == TransactionStatus::Pending && record.same_claim(transaction) =>
            {
                Ok(())
            }
            _ => Err(StoreError::TransactionConflict {
                id: transaction.id.clone(),
            }),
        }
    }

    fn commit_locked(&self, batch: CommitBatch) -> StoreResult<()> {
        let mut updates = batch.account_updates;
        updates.sort_by_key(|u| u.account_id);

        let handles = updates
            .iter()
            .map(|u| self.handle(&u.account_id))
            .collect::<StoreResult<Vec<_>>>()?;

        // Ascending id order.
        let mut guards: Vec<_> = handles.iter().map(|h| h.lock()).collect();

        for (account, update) in guards.iter().zip(&updates) {
            if account.version != update.expected_version {
                debug!(
                    account_id = %update.account_id,
                    expected = update.expected_version,
                    actual = account.version,
                    "Version check failed"
                );
                return Err(StoreError::VersionConflict {
                    account_id: Some(update.account_id),
                });
            }
        }

        let transaction = batch.transaction;
        let _records = self.records.lock();
        self.expect_claim(&transaction)?;

        // A rejected reversal is only recorded while its original is APPLIED.
        if let Some(original) = &transaction.reversal_of {
            self.expect_status(original, TransactionStatus::Applied)?;
        }

        let updated_at = now();
        for (account, update) in guards.iter_mut().zip(&updates) {
            account.balance = update.new_balance;
            account.version += 1;
            account.updated_at = updated_at;
        }

        if !batch.journal.is_empty() {
            let mut entries = batch.journal;
            entries.sort_by_key(|e| e.account_id);
            self.journal.insert(transaction.id.clone(), entries);
        }

        if let Some(original) = &batch.reverses {
            if let Some(mut record) = self.transactions.get_mut(original) {
                record.status = TransactionStatus::Reversed;
                record.reversed_by = Some(transaction.id.clone());
            }
        }

        self.transactions.insert(transaction.id.clone(), transaction);

        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_account(&self, account: &Account) -> StoreResult<()> {
        self.check_available()?;

        match self.accounts.entry(account.id) {
            Entry::Occupied(_) => Err(StoreError::DuplicateAccount(account.id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(account.clone())));
                Ok(())
            }
        }
    }

    async fn load_account(&self, id: &AccountId) -> StoreResult<Option<Account>> {
        self.check_available()?;

        let handle = match self.accounts.get(id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Ok(None),
        };
        let account = handle.lock().clone();
        Ok(Some(account))
    }

    async fn update_account_status(
        &self,
        id: &AccountId,
        expected_version: u64,
        status: AccountStatus,
    ) -> StoreResult<Account> {
        self.check_available()?;

        let handle = self.handle(id)?;
        let mut account = handle.lock();
        if account.version != expected_version {
            return Err(StoreError::VersionConflict {
                account_id: Some(*id),
            });
        }

        account.status = status;
        account.version += 1;
        account.updated_at = now();
        Ok(account.clone())
    }

    async fn claim(&self, pending: &Transaction) -> StoreResult<Claim> {
        self.check_available()?;

        match self.transactions.entry(pending.id.clone()) {
            Entry::Occupied(existing) => Ok(Claim::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(pending.clone());
                Ok(Claim::Claimed)
            }
        }
    }

    async fn take_over(&self, stale: &Transaction, fresh: &Transaction) -> StoreResult<bool> {
        self.check_available()?;

        let _records = self.records.lock();
        match self.transactions.get_mut(&stale.id) {
            Some(mut record)
                if record.status == TransactionStatus::Pending && record.same_claim(stale) =>
            {
                *record = fresh.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(&self, claim: &Transaction) -> StoreResult<()> {
        self.check_available()?;

        let _records = self.records.lock();
        self.transactions.remove_if(&claim.id, |_, record| {
            record.status == TransactionStatus::Pending && record.same_claim(claim)
        });
        Ok(())
    }

    async fn load_transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>> {
        self.check_available()?;
        Ok(self.transactions.get(id).map(|record| record.clone()))
    }

    async fn load_journal(&self, id: &TransactionId) -> StoreResult<Vec<JournalEntry>> {
        self.check_available()?;
        Ok(self
            .journal
            .get(id)
            .map(|entries| entries.clone())
            .unwrap_or_default())
    }

    async fn commit(&self, batch: CommitBatch) -> StoreResult<()> {
        self.check_available()?;

        if !batch.account_updates.is_empty() && self.take_injected_conflict() {
            return Err(StoreError::VersionConflict {
                account_id: batch.account_updates.first().map(|u| u.account_id),
            });
        }

        self.commit_locked(batch)
    }
}
