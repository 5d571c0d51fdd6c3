//! Storage abstraction for the ledger engine.
//!
//! A store persists accounts, transaction records and journal entries. The
//! engine never mutates a balance directly: it reads accounts, computes the
//! new balances and hands a [`CommitBatch`] to [`LedgerStore::commit`],
//! which applies it atomically or not at all.

use async_trait::async_trait;
use corebank_common::{AccountId, Amount, LedgerError, TransactionId};
use thiserror::Error;

use crate::account::{Account, AccountStatus};
use crate::journal::JournalEntry;
use crate::transaction::Transaction;

/// Errors raised by a store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An account version changed since it was read.
    #[error("Version conflict on account {}", display_account(.account_id))]
    VersionConflict { account_id: Option<AccountId> },

    /// A transaction record was not in the expected status.
    #[error("Transaction {id} is not in the expected status")]
    TransactionConflict { id: TransactionId },

    /// Account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Account id already taken.
    #[error("Account already exists: {0}")]
    DuplicateAccount(AccountId),

    /// Storage could not be reached.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure (corrupt row, unexpected driver error).
    #[error("Storage backend error: {0}")]
    Backend(String),
}

fn display_account(account_id: &Option<AccountId>) -> String {
    account_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { .. } => LedgerError::Contention { attempts: 1 },
            StoreError::AccountNotFound(id) => LedgerError::AccountNotFound(id),
            StoreError::Unavailable(msg) => LedgerError::StorageUnavailable(msg),
            other => LedgerError::Internal(other.to_string()),
        }
    }
}

/// Store result alias.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of claiming an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The PENDING record was inserted; the caller owns the key.
    Claimed,
    /// A record already exists under the key.
    Existing(Transaction),
}

/// Compare-and-swap of one account balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountUpdate {
    /// Account to update.
    pub account_id: AccountId,
    /// Version read during validation.
    pub expected_version: u64,
    /// Balance to write; the version becomes `expected_version + 1`.
    pub new_balance: Amount,
}

/// Everything that must become visible together when a transaction completes.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    /// Final record (APPLIED or FAILED). The stored record must still be the
    /// PENDING claim this record was made from.
    pub transaction: Transaction,
    /// Balance updates in ascending account order. Empty for FAILED.
    pub account_updates: Vec<AccountUpdate>,
    /// Journal entries, one per account update.
    pub journal: Vec<JournalEntry>,
    /// Original transaction to move from APPLIED to REVERSED.
    pub reverses: Option<TransactionId>,
}

impl CommitBatch {
    /// Batch recording a rejection without touching any balance.
    pub fn failed(transaction: Transaction) -> Self {
        Self {
            transaction,
            account_updates: Vec::new(),
            journal: Vec::new(),
            reverses: None,
        }
    }

}

/// Persistence used by [`crate::LedgerEngine`].
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a freshly opened account.
    async fn insert_account(&self, account: &Account) -> StoreResult<()>;

    /// Load an account.
    async fn load_account(&self, id: &AccountId) -> StoreResult<Option<Account>>;

    /// Change an account's status if its version is still `expected_version`.
    /// Bumps the version and returns the updated account.
    async fn update_account_status(
        &self,
        id: &AccountId,
        expected_version: u64,
        status: AccountStatus,
    ) -> StoreResult<Account>;

    /// Insert `pending` under its id, or return the record already there.
    async fn claim(&self, pending: &Transaction) -> StoreResult<Claim>;

    /// Replace the PENDING claim `stale` with `fresh`. Returns false when the
    /// stored record is no longer `stale` (completed, released or taken over).
    async fn take_over(&self, stale: &Transaction, fresh: &Transaction) -> StoreResult<bool>;

    /// Delete `claim` if it is still the PENDING record under its id.
    async fn release_claim(&self, claim: &Transaction) -> StoreResult<()>;

    /// Load a transaction record.
    async fn load_transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>>;

    /// Journal entries of a transaction, in ascending account order.
    async fn load_journal(&self, id: &TransactionId) -> StoreResult<Vec<JournalEntry>>;

    /// Apply `batch` atomically.
    async fn commit(&self, batch: CommitBatch) -> StoreResult<()>;
}
