//! Account balance views.

use corebank_common::{AccountId, Amount, Currency, Money, Timestamp};
use serde::{Deserialize, Serialize};

use crate::account::{Account, AccountStatus};

/// Account balance at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account identifier.
    pub account_id: AccountId,
    /// Currency.
    pub currency: Currency,
    /// Booked balance.
    pub balance: Amount,
    /// Funds that can be debited (balance + overdraft limit).
    pub available: Amount,
    /// Overdraft limit.
    pub overdraft_limit: Amount,
    /// Account status.
    pub status: AccountStatus,
    /// Account version this balance was read at.
    pub version: u64,
    /// When this balance was last updated.
    pub updated_at: Timestamp,
}

impl AccountBalance {
    /// Booked balance with its currency.
    pub fn money(&self) -> Money {
        Money::new(self.balance, self.currency.clone())
    }
}

impl From<&Account> for AccountBalance {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id,
            currency: account.currency.clone(),
            balance: account.balance,
            available: account.available(),
            overdraft_limit: account.overdraft_limit,
            status: account.status,
            version: account.version,
            updated_at: account.updated_at,
        }
    }
}

/// Balance of one account right after a transaction was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedBalance {
    /// Account affected.
    pub account_id: AccountId,
    /// Balance after the transaction.
    pub balance: Amount,
    /// Account version after the transaction.
    pub version: u64,
}
