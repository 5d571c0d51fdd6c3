//! Transaction kinds and the status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of balance-changing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Credit a single account from outside the ledger.
    Deposit,
    /// Debit a single account to outside the ledger.
    Withdrawal,
    /// Move funds between two accounts.
    Transfer,
}

impl TransactionKind {
    /// Kind that undoes this one.
    pub fn inverse(&self) -> TransactionKind {
        match self {
            TransactionKind::Deposit => TransactionKind::Withdrawal,
            TransactionKind::Withdrawal => TransactionKind::Deposit,
            TransactionKind::Transfer => TransactionKind::Transfer,
        }
    }

    /// Whether this kind debits a source account.
    pub fn has_source(&self) -> bool {
        matches!(self, TransactionKind::Withdrawal | TransactionKind::Transfer)
    }

    /// Whether this kind credits a destination account.
    pub fn has_destination(&self) -> bool {
        matches!(self, TransactionKind::Deposit | TransactionKind::Transfer)
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "DEPOSIT",
            TransactionKind::Withdrawal => "WITHDRAWAL",
            TransactionKind::Transfer => "TRANSFER",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEPOSIT" => Some(TransactionKind::Deposit),
            "WITHDRAWAL" => Some(TransactionKind::Withdrawal),
            "TRANSFER" => Some(TransactionKind::Transfer),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status representing the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Idempotency key claimed, outcome not yet committed.
    Pending,
    /// Balance deltas committed.
    Applied,
    /// Rejected by a business rule; no balance changed.
    Failed,
    /// Applied, then undone by a linked reversal transaction.
    Reversed,
}

impl TransactionStatus {
    /// Check if the outcome has been committed.
    pub fn is_final(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionStatus] {
        match self {
            TransactionStatus::Pending => &[TransactionStatus::Applied, TransactionStatus::Failed],
            TransactionStatus::Applied => &[TransactionStatus::Reversed],
            TransactionStatus::Failed => &[],
            TransactionStatus::Reversed => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Applied => "APPLIED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Reversed => "REVERSED",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TransactionStatus::Pending),
            "APPLIED" => Some(TransactionStatus::Applied),
            "FAILED" => Some(TransactionStatus::Failed),
            "REVERSED" => Some(TransactionStatus::Reversed),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error when attempting invalid state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid state transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}
