//! Account definitions for ledger.

use corebank_common::{now, AccountId, Amount, Currency, OwnerId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    /// Account is active and can transact.
    Active,
    /// Account is frozen (no transactions allowed).
    Frozen,
    /// Account is closed. Terminal.
    Closed,
}

impl AccountStatus {
    /// Check if transition to given status is valid.
    pub fn can_transition_to(&self, next: AccountStatus) -> bool {
        matches!(
            (self, next),
            (AccountStatus::Active, AccountStatus::Frozen)
                | (AccountStatus::Frozen, AccountStatus::Active)
                | (AccountStatus::Active, AccountStatus::Closed)
                | (AccountStatus::Frozen, AccountStatus::Closed)
        )
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Frozen => "FROZEN",
            AccountStatus::Closed => "CLOSED",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(AccountStatus::Active),
            "FROZEN" => Some(AccountStatus::Frozen),
            "CLOSED" => Some(AccountStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for opening an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    /// Owning customer.
    pub owner: OwnerId,
    /// Account currency.
    pub currency: Currency,
    /// How far below zero the balance may go, in minor units.
    pub overdraft_limit: Amount,
}

impl NewAccount {
    /// Account without overdraft.
    pub fn new(owner: impl Into<OwnerId>, currency: Currency) -> Self {
        Self {
            owner: owner.into(),
            currency,
            overdraft_limit: Amount::ZERO,
        }
    }

    /// Set the overdraft limit.
    pub fn with_overdraft(mut self, limit: Amount) -> Self {
        self.overdraft_limit = limit;
        self
    }
}

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Owning customer.
    pub owner: OwnerId,
    /// Account currency.
    pub currency: Currency,
    /// Current balance in minor units.
    pub balance: Amount,
    /// Overdraft limit in minor units (non-negative).
    pub overdraft_limit: Amount,
    /// Account status.
    pub status: AccountStatus,
    /// Optimistic concurrency token, bumped on every mutation.
    pub version: u64,
    /// When the account was created.
    pub created_at: Timestamp,
    /// When the account was last updated.
    pub updated_at: Timestamp,
}

impl Account {
    /// Open a new account with a zero balance.
    pub fn open(new: NewAccount) -> Self {
        let now = now();

        Self {
            id: AccountId::new(),
            owner: new.owner,
            currency: new.currency,
            balance: Amount::ZERO,
            overdraft_limit: new.overdraft_limit,
            status: AccountStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if account can transact.
    pub fn can_transact(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Funds that may be debited: balance plus overdraft limit.
    pub fn available(&self) -> Amount {
        self.balance
            .checked_add(self.overdraft_limit)
            .unwrap_or(Amount::from_minor(i64::MAX))
    }

    /// Check if account has sufficient funds for a debit.
    pub fn has_sufficient_funds(&self, amount: Amount) -> bool {
        self.available() >= amount
    }

    /// Balance after debiting `amount`, if it stays within the overdraft limit.
    pub fn debited(&self, amount: Amount) -> Option<Amount> {
        if !self.has_sufficient_funds(amount) {
            return None;
        }
        self.balance.checked_sub(amount)
    }

    /// Balance after crediting `amount`, if it fits.
    pub fn credited(&self, amount: Amount) -> Option<Amount> {
        self.balance.checked_add(amount)
    }
}
