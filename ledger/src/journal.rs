//! Journal entries recording the balance delta of applied transactions.

use std::collections::HashMap;
use std::fmt;

use corebank_common::{now, AccountId, Amount, Currency, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::balance::PostedBalance;

/// Type of journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// Debit entry (decreases the account balance).
    Debit,
    /// Credit entry (increases the account balance).
    Credit,
}

impl EntryType {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Debit => "DEBIT",
            EntryType::Credit => "CREDIT",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEBIT" => Some(EntryType::Debit),
            "CREDIT" => Some(EntryType::Credit),
            _ => None,
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single journal entry in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique entry ID.
    pub id: Uuid,
    /// Transaction this entry belongs to.
    pub transaction_id: TransactionId,
    /// Account affected.
    pub account_id: AccountId,
    /// Entry type (debit or credit).
    pub entry_type: EntryType,
    /// Amount (always positive).
    pub amount: Amount,
    /// Currency.
    pub currency: Currency,
    /// Balance after this entry.
    pub balance_after: Amount,
    /// Account version after this entry.
    pub version_after: u64,
    /// When this entry was created.
    pub created_at: Timestamp,
}

impl JournalEntry {
    fn new(
        transaction_id: TransactionId,
        account_id: AccountId,
        entry_type: EntryType,
        amount: Amount,
        currency: Currency,
        posted: (Amount, u64),
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            transaction_id,
            account_id,
            entry_type,
            amount,
            currency,
            balance_after: posted.0,
            version_after: posted.1,
            created_at: now(),
        }
    }

    /// Create a debit entry. `posted` is the (balance, version) after the debit.
    pub fn debit(
        transaction_id: TransactionId,
        account_id: AccountId,
        amount: Amount,
        currency: Currency,
        posted: (Amount, u64),
    ) -> Self {
        Self::new(transaction_id, account_id, EntryType::Debit, amount, currency, posted)
    }

    /// Create a credit entry. `posted` is the (balance, version) after the credit.
    pub fn credit(
        transaction_id: TransactionId,
        account_id: AccountId,
        amount: Amount,
        currency: Currency,
        posted: (Amount, u64),
    ) -> Self {
        Self::new(transaction_id, account_id, EntryType::Credit, amount, currency, posted)
    }

    /// Get signed effect on the account balance.
    pub fn signed_amount(&self) -> i128 {
        match self.entry_type {
            EntryType::Credit => i128::from(self.amount.minor()),
            EntryType::Debit => -i128::from(self.amount.minor()),
        }
    }

    /// Posted balance recorded by this entry.
    pub fn posted(&self) -> PostedBalance {
        PostedBalance {
            account_id: self.account_id,
            balance: self.balance_after,
            version: self.version_after,
        }
    }
}

/// The journal entries of one transaction, committed together.
#[derive(Debug, Clone)]
pub struct JournalBatch {
    /// Entries in the batch.
    pub entries: Vec<JournalEntry>,
    /// Transaction ID for the batch.
    pub transaction_id: TransactionId,
}

impl JournalBatch {
    /// Create a new batch.
    pub fn new(transaction_id: TransactionId) -> Self {
        Self {
            entries: Vec::new(),
            transaction_id,
        }
    }

    /// Add an entry to the batch.
    pub fn add_entry(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    /// Verify the batch is balanced (debits == credits per currency).
    ///
    /// Only transfers produce balanced batches; deposits and withdrawals
    /// move money across the ledger boundary.
    pub fn is_balanced(&self) -> bool {
        let mut balances: HashMap<&str, i128> = HashMap::new();

        for entry in &self.entries {
            *balances.entry(entry.currency.code()).or_insert(0) += entry.signed_amount();
        }

        balances.values().all(|&balance| balance == 0)
    }

    /// Get total debits.
    pub fn total_debits(&self) -> i128 {
        self.total(EntryType::Debit)
    }

    /// Get total credits.
    pub fn total_credits(&self) -> i128 {
        self.total(EntryType::Credit)
    }

    fn total(&self, entry_type: EntryType) -> i128 {
        self.entries
            .iter()
            .filter(|e| e.entry_type == entry_type)
            .map(|e| i128::from(e.amount.minor()))
            .sum()
    }

    /// Posted balances, one per touched account, in ascending account order.
    pub fn posted_balances(&self) -> Vec<PostedBalance> {
        posted_balances(&self.entries)
    }

    /// Consume the batch, returning its entries.
    pub fn into_entries(self) -> Vec<JournalEntry> {
        self.entries
    }
}

/// Posted balances recorded by `entries`, in ascending account order.
pub fn posted_balances(entries: &[JournalEntry]) -> Vec<PostedBalance> {
    let mut balances: Vec<PostedBalance> = entries.iter().map(JournalEntry::posted).collect();
    balances.sort_by_key(|b| b.account_id);
    balances
}
